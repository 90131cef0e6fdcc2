// src/calendar_tests.rs

#[cfg(test)]
mod tests {
    use crate::calendar::*;
    use chrono::{Datelike, Days, NaiveDate, Weekday};

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .unwrap_or_else(|_| panic!("Invalid date string format: {}", date_str))
    }

    fn s(date_str: &str) -> Sunday {
        Sunday::try_from(d(date_str)).expect("test date should be a Sunday")
    }

    #[test]
    fn thursday_maps_to_preceding_sunday() {
        assert_eq!(sunday_for_date(d("2024-03-14")), s("2024-03-10"));
    }

    #[test]
    fn sunday_maps_to_itself_and_saturday_to_six_days_back() {
        assert_eq!(sunday_for_date(d("2024-03-10")), s("2024-03-10"));
        assert_eq!(sunday_for_date(d("2024-03-16")), s("2024-03-10"));
        assert_eq!(sunday_for_date(d("2024-03-17")), s("2024-03-17"));
    }

    #[test]
    fn sunday_for_date_crosses_month_and_year_boundaries() {
        assert_eq!(sunday_for_date(d("2024-03-02")), s("2024-02-25"));
        assert_eq!(sunday_for_date(d("2025-01-01")), s("2024-12-29"));
        // Leap day
        assert_eq!(sunday_for_date(d("2024-02-29")), s("2024-02-25"));
    }

    #[test]
    fn sunday_for_date_is_idempotent_over_a_full_year() {
        let mut date = d("2023-12-01");
        while date < d("2025-02-01") {
            let once = sunday_for_date(date);
            assert_eq!(sunday_for_date(once.date()), once, "date {}", date);
            assert_eq!(once.date().weekday(), Weekday::Sun);
            assert!(once.date() <= date && date - once.date() < chrono::Duration::days(7));
            date = date + Days::new(1);
        }
    }

    #[test]
    fn week_dates_for_march_tenth() {
        let dates: Vec<String> = week_dates_for_sunday(s("2024-03-10"))
            .iter()
            .map(|date| format_calendar_date(*date))
            .collect();
        assert_eq!(
            dates,
            vec![
                "2024-03-10",
                "2024-03-11",
                "2024-03-12",
                "2024-03-13",
                "2024-03-14",
                "2024-03-15",
                "2024-03-16"
            ]
        );
    }

    #[test]
    fn week_dates_are_consecutive_and_start_at_input() {
        for sunday in sundays_for_year(2023) {
            let week = week_dates_for_sunday(sunday);
            assert_eq!(week.len(), 7);
            assert_eq!(week[0], sunday.date());
            for pair in week.windows(2) {
                assert_eq!(pair[1] - pair[0], chrono::Duration::days(1));
            }
        }
    }

    #[test]
    fn previous_and_next_round_trip() {
        for sunday in sundays_for_year(2024) {
            assert_eq!(next_sunday(previous_sunday(sunday)), sunday);
            assert_eq!(previous_sunday(next_sunday(sunday)), sunday);
        }
        assert_eq!(previous_sunday(s("2024-01-07")), s("2023-12-31"));
        assert_eq!(next_sunday(s("2024-12-29")), s("2025-01-05"));
    }

    #[test]
    fn sundays_for_2024() {
        let sundays = sundays_for_year(2024);
        assert_eq!(sundays.len(), 52);
        assert_eq!(sundays.first(), Some(&s("2024-01-07")));
        assert_eq!(sundays.last(), Some(&s("2024-12-29")));
    }

    #[test]
    fn sundays_for_year_starting_on_sunday_has_53() {
        // 2023-01-01 is a Sunday
        let sundays = sundays_for_year(2023);
        assert_eq!(sundays.len(), 53);
        assert_eq!(sundays[0], s("2023-01-01"));
        assert_eq!(sundays[52], s("2023-12-31"));
    }

    #[test]
    fn sundays_for_year_cover_every_sunday_exactly_once() {
        for year in [2020, 2021, 2022, 2026, 2028] {
            let sundays = sundays_for_year(year);
            let mut expected = Vec::new();
            let mut date = NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
            while date.year() == year {
                if date.weekday() == Weekday::Sun {
                    expected.push(date);
                }
                date = date + Days::new(1);
            }
            let actual: Vec<NaiveDate> = sundays.iter().map(Sunday::date).collect();
            assert_eq!(actual, expected, "year {}", year);
            assert!(sundays.len() == 52 || sundays.len() == 53);
        }
    }

    #[test]
    fn sundays_for_unrepresentable_year_is_empty() {
        assert!(sundays_for_year(i32::MAX).is_empty());
    }

    #[test]
    fn current_week_follows_the_clock() {
        let clock = FixedClock::new(d("2024-03-14"));
        assert!(is_current_week(s("2024-03-10"), &clock));
        assert!(!is_current_week(s("2024-03-17"), &clock));

        clock.set(d("2024-03-17"));
        assert!(is_current_week(s("2024-03-17"), &clock));
        assert!(!is_current_week(s("2024-03-10"), &clock));
    }

    #[test]
    fn sunday_rejects_weekdays() {
        let err = Sunday::try_from(d("2024-03-14")).unwrap_err();
        assert_eq!(err, CalendarError::NotASunday(d("2024-03-14"), Weekday::Thu));
    }

    #[test]
    fn sunday_serializes_as_plain_date_and_validates_on_read() {
        let json = serde_json::to_string(&s("2024-03-10")).unwrap();
        assert_eq!(json, "\"2024-03-10\"");
        assert_eq!(serde_json::from_str::<Sunday>(&json).unwrap(), s("2024-03-10"));
        assert!(serde_json::from_str::<Sunday>("\"2024-03-11\"").is_err());
    }

    #[test]
    fn contains_checks_the_whole_week() {
        let sunday = s("2024-03-10");
        assert!(sunday.contains(d("2024-03-10")));
        assert!(sunday.contains(d("2024-03-16")));
        assert!(!sunday.contains(d("2024-03-17")));
        assert!(!sunday.contains(d("2024-03-09")));
    }

    #[test]
    fn parse_calendar_date_is_strict() {
        assert_eq!(parse_calendar_date("2024-03-14"), Ok(d("2024-03-14")));
        assert_eq!(parse_calendar_date(" 2024-03-14 "), Ok(d("2024-03-14")));
        for bad in ["2024-3-14", "2024/03/14", "20240314", "2024-02-30", "", "abcd-ef-gh"] {
            assert_eq!(
                parse_calendar_date(bad),
                Err(CalendarError::MalformedDate(bad.to_string())),
                "input {:?}",
                bad
            );
        }
    }

    #[test]
    fn display_falls_back_to_dash() {
        assert_eq!(display_date_or_dash("2024-03-14"), "2024-03-14");
        assert_eq!(display_date_or_dash("not a date"), "-");
        assert_eq!(display_date_or_dash("2024-13-01"), "-");
    }

    #[test]
    fn sunday_display_is_zero_padded() {
        assert_eq!(s("2024-01-07").to_string(), "2024-01-07");
    }
}
