use serde_json::{json, Value};

use super::InferenceRequest;

pub const FUNCTION_NAME: &str = "generateReviewResponseFormat";

const INSTRUCTIONS: &str = r#"Review the HTML above and list the CSS classes used by its customer review section, grouped by role: the main review section container, the review list, each review item, and the rating, author, title, body and timestamp inside an item, plus the pagination controls.

If a class is not found, return null for that key while keeping the overall structure intact. If a whole section is missing, set it to null.

Also decide whether the review section is paginated. Set "pagination_info": { "exists": false } if it is not.

Answer in exactly this shape:

{
  "review_section": {
    "main_review_section_container": {
      "id": null,
      "class": null,
      "data-attributes": null
    },
    "review_body": {
      "class": null,
      "reviews_class": null,
      "review_item_class": null,
      "review_content_class": null,
      "review_title_class": null,
      "review_body_text_class": null,
      "review_timestamp_class": null,
      "review_author_class": null,
      "review_author_name_class": null,
      "review_buyer_badge_class": null,
      "review_social_class": null,
      "review_votes_class": null,
      "review_rating_class": null
    },
    "pagination": {
      "pagination_class": null,
      "page_class": null,
      "current_page_class": null,
      "next_page_class": null,
      "last_page_class": null,
      "spinner_wrapper_class": null,
      "spinner_class": null
    }
  },
  "pagination_info": { "exists": false }
}

"id" is a string, "class" an array of class names and "data-attributes" an object of attribute names to values. Every other value is a single class string or null."#;

const REVIEW_BODY_FIELDS: &[&str] = &[
    "class",
    "reviews_class",
    "review_item_class",
    "review_content_class",
    "review_title_class",
    "review_body_text_class",
    "review_timestamp_class",
    "review_author_class",
    "review_author_name_class",
    "review_buyer_badge_class",
    "review_social_class",
    "review_votes_class",
    "review_rating_class",
];

const PAGINATION_FIELDS: &[&str] = &[
    "pagination_class",
    "page_class",
    "current_page_class",
    "next_page_class",
    "last_page_class",
    "spinner_wrapper_class",
    "spinner_class",
];

pub(super) fn build_request(html: &str) -> InferenceRequest {
    InferenceRequest {
        prompt: format!("Here is the HTML of a web page:\n\n{}\n\n{}", html, INSTRUCTIONS),
        function_name: FUNCTION_NAME,
        response_format: response_format(),
    }
}

fn nullable_strings(fields: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|f| (f.to_string(), json!({ "type": ["string", "null"] })))
        .collect();
    json!({ "type": ["object", "null"], "properties": properties })
}

/// JSON Schema of the answer, used as the function's parameters.
pub(super) fn response_format() -> Value {
    json!({
        "type": "object",
        "properties": {
            "review_section": {
                "type": "object",
                "properties": {
                    "main_review_section_container": {
                        "type": ["object", "null"],
                        "properties": {
                            "id": { "type": ["string", "null"] },
                            "class": { "type": ["array", "null"], "items": { "type": "string" } },
                            "data-attributes": { "type": ["object", "null"] }
                        }
                    },
                    "review_body": nullable_strings(REVIEW_BODY_FIELDS),
                    "pagination": nullable_strings(PAGINATION_FIELDS)
                }
            },
            "pagination_info": {
                "type": "object",
                "properties": {
                    "exists": { "type": "boolean" }
                }
            }
        },
        "required": ["review_section", "pagination_info"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_the_html_before_the_instructions() {
        let request = build_request("<div class=\"jdgm-rev\">Great</div>");
        let html_at = request.prompt.find("jdgm-rev").unwrap();
        let shape_at = request.prompt.find("\"review_section\"").unwrap();
        assert!(html_at < shape_at);
        assert_eq!(request.function_name, FUNCTION_NAME);
    }

    #[test]
    fn response_format_lists_every_wire_field() {
        let format = response_format();
        let body = &format["properties"]["review_section"]["properties"]["review_body"]["properties"];
        for field in REVIEW_BODY_FIELDS {
            assert_eq!(body[*field]["type"], json!(["string", "null"]), "{}", field);
            assert!(INSTRUCTIONS.contains(&format!("\"{}\"", field)), "{}", field);
        }
        let pagination = &format["properties"]["review_section"]["properties"]["pagination"]["properties"];
        assert_eq!(pagination.as_object().unwrap().len(), PAGINATION_FIELDS.len());
    }
}
