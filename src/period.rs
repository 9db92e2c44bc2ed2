use chrono::{Datelike, Local, Month, NaiveDate};

/// Month/year tag stamped onto every record on the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodStamp {
    pub month: String,
    pub year: i32,
}

impl PeriodStamp {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            month: date.format("%B").to_string(),
            year: date.year(),
        }
    }

    /// Stamped from the host's local calendar, the month the operator sees.
    pub fn today() -> Self {
        Self::from_date(Local::now().date_naive())
    }
}

/// Period filter for dashboard queries. `month` always holds a canonical
/// English month name when set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationFilter {
    pub month: Option<String>,
    pub year: Option<i32>,
}

impl AggregationFilter {
    pub fn new(month: Option<&str>, year: Option<i32>) -> Self {
        Self {
            month: month.and_then(canonical_month),
            year,
        }
    }

    /// Builds a filter from raw query parameters. Anything unparseable is
    /// treated as "no filter" for that field.
    pub fn from_query(month: Option<&str>, year: Option<&str>) -> Self {
        let year = year.and_then(|value| value.trim().parse::<i32>().ok());
        Self::new(month, year)
    }

    pub fn matches(&self, month: &str, year: i32) -> bool {
        self.month.as_deref().map_or(true, |wanted| wanted == month)
            && self.year.map_or(true, |wanted| wanted == year)
    }

    pub fn label(&self) -> String {
        match (&self.month, self.year) {
            (Some(month), Some(year)) => format!("{month} {year}"),
            (Some(month), None) => format!("{month} (all years)"),
            (None, Some(year)) => year.to_string(),
            (None, None) => "all periods".to_string(),
        }
    }
}

pub fn month_names() -> Vec<&'static str> {
    (1u8..=12)
        .filter_map(|number| Month::try_from(number).ok())
        .map(|month| month.name())
        .collect()
}

/// Resolves a month given as a name ("september", "Sep") or a number
/// ("9") to its canonical English name.
pub fn canonical_month(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        return raw
            .parse::<u8>()
            .ok()
            .and_then(|number| Month::try_from(number).ok())
            .map(|month| month.name().to_string());
    }

    raw.parse::<Month>()
        .ok()
        .map(|month| month.name().to_string())
}
