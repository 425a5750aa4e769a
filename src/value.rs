use serde_json::Value;

/// Classified shape of a stored measurement value.
///
/// Submitted values are schema-less JSON: a plain number, a mapping carrying
/// a `total`, a male/female breakdown, or something unrecognized. Anything
/// unrecognized extracts to zero rather than erroring, so records with garbage
/// values cannot poison a whole series.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureValue {
    Number(f64),
    TotalWrapped(f64),
    GenderSplit { male: f64, female: f64 },
    Other,
}

impl MeasureValue {
    /// Classify a raw JSON value.
    ///
    /// A mapping with a non-null `total` key wins over a gender breakdown;
    /// a mapping with a null or absent `total` falls through to male/female.
    pub fn from_json(value: &Value) -> Self {
        if let Some(n) = value.as_f64() {
            return MeasureValue::Number(n);
        }
        if let Value::Object(map) = value {
            match map.get("total") {
                Some(total) if !total.is_null() => {
                    return MeasureValue::TotalWrapped(coerce_number(total));
                }
                _ => {
                    return MeasureValue::GenderSplit {
                        male: map.get("male").map_or(0.0, coerce_number),
                        female: map.get("female").map_or(0.0, coerce_number),
                    };
                }
            }
        }
        MeasureValue::Other
    }

    /// Single numeric magnitude of the value.
    pub fn total(&self) -> f64 {
        match self {
            MeasureValue::Number(n) => *n,
            MeasureValue::TotalWrapped(n) => *n,
            MeasureValue::GenderSplit { male, female } => male + female,
            MeasureValue::Other => 0.0,
        }
    }
}

/// Extract the numeric magnitude of a raw stored value.
pub fn extract_total(value: &Value) -> f64 {
    MeasureValue::from_json(value).total()
}

/// Numbers pass through; numeric strings coerce; everything else is 0.
fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
