//! Prompt assembly: base template, field-resolution instructions, option context and
//! batch-shape instructions.

use crate::models::FieldDescriptor;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const SELECT_PLACEHOLDER: &str = "-- Select --";

const MAX_LISTED_OPTIONS: usize = 20;
const SAMPLE_OPTIONS: usize = 10;

const OPTION_CONTEXT_LEAD_IN: &str = "Gain additional context on the images based on the following user selected options which describe the images:";

const RESOLUTION_LEAD_IN: &str = "ADDITIONAL TASK: Based on the images and any existing information, please attempt to determine appropriate values for the following category fields that the user has not filled in:";

const RESOLUTION_CLOSING: &str = r#"IMPORTANT: Please include these determined values in your JSON response under a new field called 'aiResolvedFields'.
The structure should be:
{
    "title": "your title here",
    "description": "your description here",
    "aiResolvedFields": {
        "FieldLabel1": "determined value",
        "FieldLabel2": "determined value"
    }
}

Only include fields in aiResolvedFields that you can reasonably determine from the images. If you cannot determine a value with confidence, omit that field entirely from aiResolvedFields."#;

fn is_unfilled(value: Option<&String>) -> bool {
    match value {
        None => true,
        Some(v) => v.trim().is_empty() || v == SELECT_PLACEHOLDER,
    }
}

/// Appends resolution instructions for every field the user left blank.
///
/// Returns the base prompt untouched when nothing needs resolving.
pub fn compose_field_resolution<'a>(
    base: &'a str,
    fields: &[FieldDescriptor],
    provided: &BTreeMap<String, String>,
) -> Cow<'a, str> {
    let empty: Vec<&FieldDescriptor> = fields
        .iter()
        .filter(|field| is_unfilled(provided.get(&field.label)))
        .collect();

    if empty.is_empty() {
        return Cow::Borrowed(base);
    }

    let mut prompt = String::with_capacity(base.len() + 512);
    prompt.push_str(base);
    prompt.push_str("\n\n");
    prompt.push_str(RESOLUTION_LEAD_IN);
    prompt.push_str("\n\n");

    for field in empty {
        let _ = writeln!(prompt, "**{}**:", field.label);
        let options = field.option_list();
        if options.is_empty() {
            prompt.push_str("- Provide an appropriate value\n");
        } else if options.len() <= MAX_LISTED_OPTIONS {
            let _ = writeln!(prompt, "- Choose from: {}", options.join(", "));
        } else {
            let _ = writeln!(
                prompt,
                "- Choose from available options (there are {} total options)",
                options.len()
            );
            let _ = writeln!(
                prompt,
                "- Some examples: {}",
                options[..SAMPLE_OPTIONS].join(", ")
            );
        }
        prompt.push_str(
            "- If you cannot determine a value from the images, use 'Unknown' or 'Not Specified'\n\n",
        );
    }

    prompt.push_str(RESOLUTION_CLOSING);
    prompt.push_str("\n\n");
    Cow::Owned(prompt)
}

pub fn with_option_context(prompt: &str, options: &Map<String, Value>) -> String {
    if options.is_empty() {
        return prompt.to_string();
    }
    let rendered = serde_json::to_string_pretty(options).unwrap_or_else(|_| "{}".into());
    format!("{prompt}\n\n{OPTION_CONTEXT_LEAD_IN}\n{rendered}")
}

/// Instructions telling the model to answer one batch with a JSON array.
pub fn batch_instructions(prompt: &str, group_count: usize, resolve_fields: bool) -> String {
    let shape = if resolve_fields {
        "{\n    \"title\": \"Product title here\",\n    \"description\": \"Product description here\",\n    \"aiResolvedFields\": {}\n}"
    } else {
        "{\n    \"title\": \"Product title here\",\n    \"description\": \"Product description here\"\n}"
    };
    format!(
        "{prompt}\n\n\
         IMPORTANT: You are processing {group_count} separate product groups.\n\
         Each group represents a different product that needs its own listing.\n\n\
         Please return a JSON array with exactly {group_count} objects, one for each product group.\n\
         Each object should follow this format:\n\
         {shape}\n\n\
         Process each group of images as a separate product. Return ONLY the JSON array, no additional text."
    )
}

pub fn group_separator(index: usize) -> String {
    format!("\n--- PRODUCT GROUP {} ---", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(label: &str, options: &str) -> FieldDescriptor {
        FieldDescriptor {
            label: label.into(),
            options: options.into(),
        }
    }

    fn provided(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn returns_base_when_every_field_is_filled() {
        let fields = vec![field("Color", "Red;Blue")];
        let out = compose_field_resolution("Describe this.", &fields, &provided(&[("Color", "Red")]));
        assert!(matches!(out, Cow::Borrowed("Describe this.")));
    }

    #[test]
    fn placeholder_and_blank_values_count_as_empty() {
        let fields = vec![field("Color", "Red;Blue"), field("Size", ""), field("Brand", "")];
        let out = compose_field_resolution(
            "Base",
            &fields,
            &provided(&[("Color", SELECT_PLACEHOLDER), ("Size", "   "), ("Brand", "Acme")]),
        );
        assert!(out.starts_with("Base\n\nADDITIONAL TASK"));
        assert!(out.contains("**Color**:\n- Choose from: Red, Blue\n"));
        assert!(out.contains("**Size**:\n- Provide an appropriate value\n"));
        assert!(!out.contains("**Brand**"));
        assert!(out.contains("'aiResolvedFields'"));
    }

    #[test]
    fn long_option_lists_are_summarised() {
        let options = (1..=25).map(|n| format!("opt{n}")).collect::<Vec<_>>().join(";");
        let fields = vec![field("Year", &options)];
        let out = compose_field_resolution("Base", &fields, &BTreeMap::new());
        assert!(out.contains("(there are 25 total options)"));
        assert!(out.contains("- Some examples: opt1, opt2, opt3, opt4, opt5, opt6, opt7, opt8, opt9, opt10\n"));
        assert!(!out.contains("opt11"));
    }

    #[test]
    fn twenty_options_are_listed_in_full() {
        let options = (1..=20).map(|n| format!("o{n}")).collect::<Vec<_>>().join(";");
        let out = compose_field_resolution("Base", &[field("F", &options)], &BTreeMap::new());
        assert!(out.contains("- Choose from: o1,"));
        assert!(out.contains("o20\n"));
    }

    #[test]
    fn option_context_is_pretty_json() {
        let options = json!({"Brand": "Mattel"}).as_object().cloned().unwrap();
        let out = with_option_context("Describe this.", &options);
        assert_eq!(
            out,
            format!("Describe this.\n\n{OPTION_CONTEXT_LEAD_IN}\n{{\n  \"Brand\": \"Mattel\"\n}}")
        );
        assert_eq!(with_option_context("Describe this.", &Map::new()), "Describe this.");
    }

    #[test]
    fn batch_instructions_mention_count_and_shape() {
        let out = batch_instructions("Base", 3, true);
        assert!(out.contains("exactly 3 objects"));
        assert!(out.contains("\"aiResolvedFields\": {}"));
        assert!(!batch_instructions("Base", 2, false).contains("aiResolvedFields"));
        assert_eq!(group_separator(0), "\n--- PRODUCT GROUP 1 ---");
    }
}
