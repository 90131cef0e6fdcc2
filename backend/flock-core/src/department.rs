// src/department.rs
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::warn;

// Legacy department name -> current display name.
const BUILTIN_ALIASES: [(&str, &str); 1] = [("아동부", "유치부")];

static DEFAULT_ALIASES: Lazy<DepartmentAliases> = Lazy::new(DepartmentAliases::builtin);

/// Historical-to-display department names. Every department comparison in
/// the crate goes through [`DepartmentAliases::resolve`] on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepartmentAliases {
    aliases: HashMap<String, String>,
}

impl DepartmentAliases {
    pub fn builtin() -> Self {
        Self {
            aliases: BUILTIN_ALIASES
                .iter()
                .map(|(legacy, display)| (legacy.to_string(), display.to_string()))
                .collect(),
        }
    }

    /// Builtin table plus `legacy=display` pairs separated by `;` or `,`.
    /// Malformed pairs are logged and skipped.
    pub fn with_extra(pairs: &str) -> Self {
        let mut table = Self::builtin();
        for pair in pairs.split([';', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((legacy, display)) if !legacy.trim().is_empty() && !display.trim().is_empty() => {
                    let (legacy, display) = (legacy.trim(), display.trim());
                    if table.chain(display).any(|name| name == legacy) {
                        warn!("Ignoring department alias '{}' that would loop", pair);
                        continue;
                    }
                    table
                        .aliases
                        .insert(legacy.to_string(), display.to_string());
                }
                _ => warn!("Ignoring malformed department alias '{}'", pair),
            }
        }
        table
    }

    /// `name` followed by every alias it leads to. The table has no loops,
    /// the step bound only keeps a broken one finite.
    fn chain<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        std::iter::successors(Some(name), move |current| {
            self.aliases.get(*current).map(String::as_str)
        })
        .take(self.aliases.len() + 1)
    }

    /// Follows aliases until the name has none, so `a=b;b=c` takes `a` to `c`.
    pub fn resolve<'a>(&'a self, raw: &'a str) -> &'a str {
        self.chain(raw.trim()).last().unwrap_or(raw)
    }

    pub fn matches(&self, a: &str, b: &str) -> bool {
        self.resolve(a) == self.resolve(b)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

impl Default for DepartmentAliases {
    fn default() -> Self {
        Self::builtin()
    }
}

pub fn resolve_department_alias(raw: &str) -> &str {
    DEFAULT_ALIASES.resolve(raw)
}

pub fn departments_match(a: &str, b: &str) -> bool {
    DEFAULT_ALIASES.matches(a, b)
}
