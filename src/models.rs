use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

pub const RESOLVE_FIELDS_KEY: &str = "_aiResolveCategoryFields";
pub const CATEGORY_FIELDS_KEY: &str = "_categoryFields";

/// Raw invocation event, exactly as callers send it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvocationEvent {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, rename = "subCategory")]
    pub sub_category: Option<String>,
    #[serde(default, rename = "SelectedCategoryOptions")]
    pub selected_category_options: Option<Map<String, Value>>,
    #[serde(default, rename = "Base64Key")]
    pub image_groups: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FieldDescriptor {
    #[serde(rename = "FieldLabel", default)]
    pub label: String,
    #[serde(rename = "CategoryOptions", default, deserialize_with = "lenient_string")]
    pub options: String,
}

impl FieldDescriptor {
    pub fn option_list(&self) -> Vec<&str> {
        self.options
            .split(';')
            .map(str::trim)
            .filter(|opt| !opt.is_empty())
            .collect()
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(";"),
        Some(other) => other.to_string(),
    })
}

pub type ImageGroup = Vec<String>;

/// Typed request with control flags separated from user-selected options.
#[derive(Debug, Clone, Default)]
pub struct ListingRequest {
    pub category: String,
    pub sub_category: String,
    pub options: Map<String, Value>,
    pub resolve_fields: bool,
    pub category_fields: Vec<FieldDescriptor>,
    pub image_groups: Vec<ImageGroup>,
}

impl ListingRequest {
    /// Returns `None` when category or sub-category is missing or blank.
    pub fn from_event(event: InvocationEvent) -> Option<Self> {
        let category = event.category.filter(|v| !v.trim().is_empty())?;
        let sub_category = event.sub_category.filter(|v| !v.trim().is_empty())?;

        let mut options = Map::new();
        let mut resolve_fields = false;
        let mut category_fields = Vec::new();
        for (key, value) in event.selected_category_options.unwrap_or_default() {
            match key.as_str() {
                RESOLVE_FIELDS_KEY => resolve_fields = flag_value(&value),
                CATEGORY_FIELDS_KEY => {
                    category_fields =
                        serde_json::from_value::<Vec<FieldDescriptor>>(value).unwrap_or_default();
                }
                _ => {
                    options.insert(key, value);
                }
            }
        }

        Some(Self {
            category,
            sub_category,
            options,
            resolve_fields,
            category_fields,
            image_groups: event.image_groups.unwrap_or_default(),
        })
    }

    /// User-provided option values as plain text, keyed by field label.
    pub fn provided_values(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect()
    }
}

fn flag_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => crate::config::parse_bool(s),
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

/// Canonical per-product output record.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "aiResolvedFields")]
    pub ai_resolved_fields: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
    pub raw_content: Option<String>,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ListingRecord {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn unparsed(error: impl Into<String>, raw: &str) -> Self {
        Self {
            error: Some(error.into()),
            raw_content: Some(raw.to_string()),
            ..Self::default()
        }
    }

    pub fn exhausted(error: impl Into<String>, last_error: &str) -> Self {
        Self {
            error: Some(error.into()),
            last_error: Some(last_error.to_string()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Synchronous invocation envelope: status plus JSON text body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl InvocationResponse {
    pub fn ok(records: &[ListingRecord]) -> Self {
        Self {
            status_code: 200,
            body: serde_json::to_string(records).unwrap_or_else(|_| "[]".into()),
        }
    }

    pub fn error(status_code: u16, body: &Value) -> Self {
        Self {
            status_code,
            body: body.to_string(),
        }
    }

    pub fn message(status_code: u16, message: &str) -> Self {
        Self::error(status_code, &json!({ "error": message }))
    }

    #[cfg(test)]
    pub fn body_json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::String(self.body.clone()))
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value: Value) -> InvocationEvent {
        serde_json::from_value(value).expect("event")
    }

    #[test]
    fn separates_control_keys_from_options() {
        let request = ListingRequest::from_event(event(json!({
            "category": "Toys",
            "subCategory": "Cars",
            "SelectedCategoryOptions": {
                "Brand": "Mattel",
                "_aiResolveCategoryFields": true,
                "_categoryFields": [
                    {"FieldLabel": "Scale", "CategoryOptions": "1:64; 1:43;"},
                    {"FieldLabel": "Era"}
                ]
            },
            "Base64Key": [["img1"], ["img2", "img3"]]
        })))
        .expect("valid request");

        assert!(request.resolve_fields);
        assert_eq!(request.category_fields.len(), 2);
        assert_eq!(request.category_fields[0].option_list(), vec!["1:64", "1:43"]);
        assert!(request.category_fields[1].option_list().is_empty());
        assert_eq!(request.options.len(), 1);
        assert_eq!(request.options["Brand"], json!("Mattel"));
        assert_eq!(request.image_groups.len(), 2);
    }

    #[test]
    fn missing_or_blank_category_is_rejected() {
        assert!(ListingRequest::from_event(event(json!({"subCategory": "Cars"}))).is_none());
        assert!(
            ListingRequest::from_event(event(json!({"category": " ", "subCategory": "Cars"})))
                .is_none()
        );
        assert!(ListingRequest::from_event(event(json!({"category": "Toys"}))).is_none());
    }

    #[test]
    fn optional_inputs_default_to_empty() {
        let request =
            ListingRequest::from_event(event(json!({"category": "Toys", "subCategory": "Cars"})))
                .expect("valid");
        assert!(request.options.is_empty());
        assert!(request.image_groups.is_empty());
        assert!(!request.resolve_fields);
    }

    #[test]
    fn record_serializes_without_empty_fields() {
        let record = ListingRecord {
            title: Some("Hot Wheels Car".into()),
            description: Some("Red toy car".into()),
            ..ListingRecord::default()
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"title":"Hot Wheels Car","description":"Red toy car"}"#
        );
    }

    #[test]
    fn error_envelope_body_is_json_text() {
        let response = InvocationResponse::message(400, "Missing category or subcategory");
        assert_eq!(response.status_code, 400);
        assert_eq!(
            response.body_json(),
            json!({"error": "Missing category or subcategory"})
        );
    }
}
