// src/main.rs

use reqwest::{header, Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::error::Error;

const DEPARTMENT: &str = "청년부";

// Response types
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WeekInfo {
    sunday: String,
    dates: Vec<String>,
    previous: String,
    next: String,
    is_current_week: bool,
}

#[derive(Debug, Deserialize)]
struct Member {
    id: String,
    name: String,
    department: String,
}

#[derive(Debug, Deserialize)]
struct Record {
    member_id: String,
    date: String,
    attended: bool,
    status_note: Option<String>,
}

fn as_admin(request: RequestBuilder) -> Result<RequestBuilder, Box<dyn Error>> {
    let mut headers = header::HeaderMap::new();
    headers.insert("x-flock-user", header::HeaderValue::from_static("smoke-test"));
    headers.insert("x-flock-role", header::HeaderValue::from_static("admin"));
    headers.insert(
        "x-flock-department",
        header::HeaderValue::from_bytes(DEPARTMENT.as_bytes())?,
    );
    Ok(request.headers(headers))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let base_url =
        std::env::var("FLOCK_TEST_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let client = Client::new();

    // Test 1: Health check
    println!("\n🔍 Testing health check endpoint...");
    let health = client
        .get(format!("{}/health", base_url))
        .send()
        .await?
        .json::<HealthResponse>()
        .await?;
    println!("Health check response: {:?}", health);

    // Test 2: Calendar week
    println!("\n🔍 Testing calendar week for 2024-03-14...");
    let week = client
        .get(format!("{}/api/calendar/week?date=2024-03-14", base_url))
        .send()
        .await?
        .json::<WeekInfo>()
        .await?;
    println!(
        "Week of {} ({} .. {}), previous {}, next {}, current: {}",
        week.sunday,
        week.dates.first().map(String::as_str).unwrap_or("-"),
        week.dates.last().map(String::as_str).unwrap_or("-"),
        week.previous,
        week.next,
        week.is_current_week
    );

    // Test 3: Register a member
    println!("\n🔍 Registering a test member in {}...", DEPARTMENT);
    let response = as_admin(client.post(format!("{}/api/members", base_url)))?
        .json(&json!({ "name": "테스트 성도", "department": DEPARTMENT }))
        .send()
        .await?;
    println!("Register status: {}", response.status());
    if !response.status().is_success() {
        println!("Failed to register member: {}", response.text().await?);
        return Ok(());
    }
    let member = response.json::<Member>().await?;
    println!("Member: {:?}", member);

    // Test 4: Toggle attendance and add a note
    println!("\n🔍 Toggling attendance for {} on {}...", member.name, week.sunday);
    let record = as_admin(client.post(format!("{}/api/attendance/toggle", base_url)))?
        .json(&json!({ "member_id": member.id, "date": week.sunday }))
        .send()
        .await?
        .json::<Record>()
        .await?;
    println!("Record: {:?}", record);

    let record = as_admin(client.put(format!("{}/api/attendance/note", base_url)))?
        .json(&json!({ "member_id": member.id, "date": week.sunday, "note": "smoke test note" }))
        .send()
        .await?
        .json::<Record>()
        .await?;
    println!("Record with note: {:?}", record);

    // Test 5: Week sheet
    println!("\n🔍 Fetching the week sheet...");
    let sheet = client
        .get(format!(
            "{}/api/departments/{}/weeks/{}",
            base_url, member.department, week.sunday
        ))
        .send()
        .await?
        .json::<Value>()
        .await?;
    println!("Summary: {}", sheet["summary"]);

    // Test 6: Finalize, try an edit, reopen
    println!("\n🔍 Finalizing the week...");
    let report_url = format!(
        "{}/api/departments/{}/weeks/{}/report",
        base_url, member.department, week.sunday
    );
    let response = as_admin(client.post(&report_url))?.send().await?;
    println!("Finalize status: {}", response.status());

    let report = client.get(&report_url).send().await?.json::<Value>().await?;
    println!("Finalized report: {}", report);

    let response = as_admin(client.post(format!("{}/api/attendance/toggle", base_url)))?
        .json(&json!({ "member_id": member.id, "date": week.sunday }))
        .send()
        .await?;
    println!("Edit after finalize status (expect 409): {}", response.status());

    let response = as_admin(client.delete(&report_url))?.send().await?;
    println!("Reopen status: {}", response.status());

    // Test 7: Clean up
    println!("\n🔍 Deleting the test member...");
    let response = as_admin(client.delete(format!("{}/api/members/{}", base_url, member.id)))?
        .send()
        .await?;
    println!("Delete status: {}", response.status());

    println!("\n✅ Testing complete!");

    Ok(())
}
