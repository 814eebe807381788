// Copyright 2026 the vakt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The static tool catalog.
//!
//! One table drives parameter validation, the `/tools` documentation
//! surface, the `/api/schema` dump, and the tool→engine-method resolution,
//! so the four can never drift apart. The table is immutable after process
//! start.

use serde::Serialize;
use serde_json::{json, Value};

/// Primitive type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Any JSON string.
    String,
    /// Integer (a JSON number with no fractional part).
    Int,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// String restricted to a fixed choice set.
    Enum(&'static [&'static str]),
}

impl ParamType {
    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Enum(_) => "enum",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Enum(choices) => value
                .as_str()
                .map(|s| choices.contains(&s))
                .unwrap_or(false),
        }
    }
}

/// One declared parameter.
#[derive(Debug)]
pub struct ParamSpec {
    /// Parameter name as it appears in the request body.
    pub name: &'static str,
    /// Declared primitive type.
    pub ty: ParamType,
    /// Whether the parameter must be present.
    pub required: bool,
}

/// One tool: the unit of invocation on `/execute/{name}`.
#[derive(Debug)]
pub struct ToolSpec {
    /// Public tool name.
    pub name: &'static str,
    /// Human-readable description, served on `/tools/{name}`.
    pub description: &'static str,
    /// Engine method the tool resolves to.
    pub method: &'static str,
    /// Ordered parameter list.
    pub params: &'static [ParamSpec],
}

/// A single structured validation error.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    /// Offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

/// Everything a failed validation reports back to the client.
#[derive(Debug, Default)]
pub struct ValidationFailure {
    /// Required parameters that were absent, in declaration order.
    pub missing_fields: Vec<String>,
    /// Supplied parameters the tool does not declare.
    pub unknown_fields: Vec<String>,
    /// Human-readable list of the tool's parameters.
    pub supported_fields: String,
    /// Structured errors, capped at [`MAX_FIELD_ERRORS`].
    pub errors: Vec<FieldError>,
}

/// Cap on structured error entries per response.
pub const MAX_FIELD_ERRORS: usize = 32;

impl ValidationFailure {
    /// One-line summary used as the response's `error` string.
    pub fn summary(&self) -> String {
        if !self.missing_fields.is_empty() {
            format!(
                "Missing required parameters: {}",
                self.missing_fields.join(", ")
            )
        } else if !self.unknown_fields.is_empty() {
            format!("Unknown parameters: {}", self.unknown_fields.join(", "))
        } else {
            "Parameter validation failed".to_owned()
        }
    }

    fn push(&mut self, field: &str, message: String) {
        if self.errors.len() < MAX_FIELD_ERRORS {
            self.errors.push(FieldError {
                field: field.to_owned(),
                message,
            });
        }
    }
}

/// Why a lookup-and-validate failed.
#[derive(Debug)]
pub enum ToolError {
    /// No such tool; the payload carries a supported-tools hint.
    Unknown(String),
    /// The tool exists but the parameters do not satisfy its schema.
    Invalid(ValidationFailure),
}

const fn p(name: &'static str, ty: ParamType, required: bool) -> ParamSpec {
    ParamSpec { name, ty, required }
}

const CONTENT_FORMATS: &[&str] = &["html", "text"];
const MOUSE_BUTTONS: &[&str] = &["left", "middle", "right"];
const WAIT_STATES: &[&str] = &["visible", "hidden", "attached"];
const IMAGE_FORMATS: &[&str] = &["jpeg", "png"];

/// The catalog. Ordering is the ordering of every public listing.
static CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "browser_create_context",
        description: "Create a browser context and return its context_id",
        method: "create_context",
        params: &[
            p("width", ParamType::Int, false),
            p("height", ParamType::Int, false),
            p("user_agent", ParamType::String, false),
            p("headless", ParamType::Bool, false),
        ],
    },
    ToolSpec {
        name: "browser_close_context",
        description: "Close a browser context and release its resources",
        method: "close_context",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_list_contexts",
        description: "List all open browser contexts",
        method: "list_contexts",
        params: &[],
    },
    ToolSpec {
        name: "browser_navigate",
        description: "Navigate a context to a URL",
        method: "navigate",
        params: &[
            p("context_id", ParamType::String, true),
            p("url", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_back",
        description: "Go back one history entry",
        method: "back",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_forward",
        description: "Go forward one history entry",
        method: "forward",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_reload",
        description: "Reload the current page",
        method: "reload",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_get_url",
        description: "Current URL of a context",
        method: "get_url",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_get_title",
        description: "Current page title of a context",
        method: "get_title",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_get_content",
        description: "Page content as HTML or extracted text",
        method: "get_content",
        params: &[
            p("context_id", ParamType::String, true),
            p("format", ParamType::Enum(CONTENT_FORMATS), false),
        ],
    },
    ToolSpec {
        name: "browser_click",
        description: "Click the element matching a selector",
        method: "click",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
            p("button", ParamType::Enum(MOUSE_BUTTONS), false),
            p("click_count", ParamType::Int, false),
        ],
    },
    ToolSpec {
        name: "browser_type",
        description: "Type text into the element matching a selector",
        method: "type",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
            p("text", ParamType::String, true),
            p("delay_ms", ParamType::Int, false),
        ],
    },
    ToolSpec {
        name: "browser_press_key",
        description: "Press a key, optionally with modifiers",
        method: "press_key",
        params: &[
            p("context_id", ParamType::String, true),
            p("key", ParamType::String, true),
            p("modifiers", ParamType::String, false),
        ],
    },
    ToolSpec {
        name: "browser_hover",
        description: "Hover the element matching a selector",
        method: "hover",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_scroll",
        description: "Scroll the page or an element into view",
        method: "scroll",
        params: &[
            p("context_id", ParamType::String, true),
            p("x", ParamType::Int, false),
            p("y", ParamType::Int, false),
            p("selector", ParamType::String, false),
        ],
    },
    ToolSpec {
        name: "browser_select_option",
        description: "Select an option of a <select> element",
        method: "select_option",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
            p("value", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_wait",
        description: "Wait a fixed number of milliseconds",
        method: "wait",
        params: &[
            p("context_id", ParamType::String, true),
            p("ms", ParamType::Int, false),
        ],
    },
    ToolSpec {
        name: "browser_wait_for_selector",
        description: "Wait until a selector reaches the requested state",
        method: "wait_for_selector",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
            p("state", ParamType::Enum(WAIT_STATES), false),
            p("timeout_ms", ParamType::Int, false),
        ],
    },
    ToolSpec {
        name: "browser_query_selector",
        description: "Query the page for elements matching a selector",
        method: "query_selector",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_get_text",
        description: "Text content of the element matching a selector",
        method: "get_text",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_get_attribute",
        description: "Attribute value of the element matching a selector",
        method: "get_attribute",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
            p("name", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_evaluate",
        description: "Evaluate a JavaScript expression in the page",
        method: "evaluate",
        params: &[
            p("context_id", ParamType::String, true),
            p("expression", ParamType::String, true),
        ],
    },
    ToolSpec {
        name: "browser_screenshot",
        description: "Capture a screenshot of the page or an element",
        method: "screenshot",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, false),
            p("format", ParamType::Enum(IMAGE_FORMATS), false),
            p("quality", ParamType::Int, false),
            p("full_page", ParamType::Bool, false),
        ],
    },
    ToolSpec {
        name: "browser_set_viewport",
        description: "Resize a context's viewport",
        method: "set_viewport",
        params: &[
            p("context_id", ParamType::String, true),
            p("width", ParamType::Int, true),
            p("height", ParamType::Int, true),
        ],
    },
    ToolSpec {
        name: "browser_get_cookies",
        description: "Cookies visible to a context, optionally for one URL",
        method: "get_cookies",
        params: &[
            p("context_id", ParamType::String, true),
            p("url", ParamType::String, false),
        ],
    },
    ToolSpec {
        name: "browser_set_cookie",
        description: "Set a cookie in a context",
        method: "set_cookie",
        params: &[
            p("context_id", ParamType::String, true),
            p("name", ParamType::String, true),
            p("value", ParamType::String, true),
            p("domain", ParamType::String, false),
            p("path", ParamType::String, false),
            p("expires", ParamType::Number, false),
            p("secure", ParamType::Bool, false),
            p("http_only", ParamType::Bool, false),
        ],
    },
    ToolSpec {
        name: "browser_clear_cookies",
        description: "Clear all cookies of a context",
        method: "clear_cookies",
        params: &[p("context_id", ParamType::String, true)],
    },
    ToolSpec {
        name: "browser_upload_file",
        description: "Attach a file to a file input element",
        method: "upload_file",
        params: &[
            p("context_id", ParamType::String, true),
            p("selector", ParamType::String, true),
            p("file_path", ParamType::String, true),
        ],
    },
    // live-stream controls also arm/disarm the MJPEG streamer registry
    ToolSpec {
        name: "start_live_stream",
        description: "Start publishing MJPEG frames for a context",
        method: "start_live_stream",
        params: &[
            p("context_id", ParamType::String, true),
            p("fps", ParamType::Int, false),
            p("quality", ParamType::Int, false),
        ],
    },
    ToolSpec {
        name: "stop_live_stream",
        description: "Stop publishing MJPEG frames for a context",
        method: "stop_live_stream",
        params: &[p("context_id", ParamType::String, true)],
    },
    // license subsurface: served locally via one-shot engine invocations,
    // available even while the engine is not Ready
    ToolSpec {
        name: "get_license_status",
        description: "Current license status of the engine installation",
        method: "get_license_status",
        params: &[],
    },
    ToolSpec {
        name: "get_hardware_fingerprint",
        description: "Hardware fingerprint for license issuance",
        method: "get_hardware_fingerprint",
        params: &[],
    },
    ToolSpec {
        name: "add_license",
        description: "Install a license file and restart the engine",
        method: "add_license",
        params: &[p("license_path", ParamType::String, true)],
    },
    ToolSpec {
        name: "remove_license",
        description: "Remove the installed license and restart the engine",
        method: "remove_license",
        params: &[],
    },
    ToolSpec {
        name: "get_license_info",
        description: "Detailed license information",
        method: "get_license_info",
        params: &[p("context_id", ParamType::String, false)],
    },
];

/// Tools served by the local license manager instead of the engine channel.
pub const LICENSE_TOOLS: &[&str] = &[
    "get_license_status",
    "get_hardware_fingerprint",
    "add_license",
    "remove_license",
];

/// Like [`LICENSE_TOOLS`] but only routed locally while the engine is not
/// Ready.
pub const LICENSE_TOOLS_WHEN_DOWN: &[&str] = &["get_license_info"];

/// Static lookup/validation facade over the catalog.
#[derive(Debug)]
pub struct ToolRegistry;

impl ToolRegistry {
    /// Every tool, in catalog order.
    pub fn all() -> &'static [ToolSpec] {
        CATALOG
    }

    /// Finds a tool by name. A `browser_`-prefixed alias of a license tool
    /// resolves to the unprefixed entry, which keeps older clients working.
    pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
        CATALOG.iter().find(|t| t.name == name).or_else(|| {
            let stripped = name.strip_prefix("browser_")?;
            if LICENSE_TOOLS.contains(&stripped) || LICENSE_TOOLS_WHEN_DOWN.contains(&stripped)
            {
                CATALOG.iter().find(|t| t.name == stripped)
            } else {
                None
            }
        })
    }

    /// Looks the tool up and validates `params` against its schema.
    pub fn validate(name: &str, params: &Value) -> Result<&'static ToolSpec, ToolError> {
        let spec = Self::lookup(name).ok_or_else(|| {
            let supported: Vec<&str> = CATALOG.iter().map(|t| t.name).collect();
            ToolError::Unknown(format!(
                "Unknown tool '{name}'. Supported tools: {}",
                supported.join(", ")
            ))
        })?;

        let mut failure = ValidationFailure {
            supported_fields: supported_fields(spec),
            ..Default::default()
        };

        let object = match params {
            Value::Null => None,
            Value::Object(map) => Some(map),
            _ => {
                failure.push("params", "params must be a JSON object".to_owned());
                return Err(ToolError::Invalid(failure));
            }
        };

        for param in spec.params {
            let present = object.and_then(|o| o.get(param.name));
            match present {
                None | Some(Value::Null) => {
                    if param.required {
                        failure.missing_fields.push(param.name.to_owned());
                        failure.push(
                            param.name,
                            "missing required parameter".to_owned(),
                        );
                    }
                }
                Some(value) => {
                    if !param.ty.accepts(value) {
                        let message = match param.ty {
                            ParamType::Enum(choices) => format!(
                                "must be one of: {}",
                                choices.join(", ")
                            ),
                            ty => format!("must be a {}", ty.name()),
                        };
                        failure.push(param.name, message);
                    }
                }
            }
        }

        if let Some(object) = object {
            for key in object.keys() {
                if !spec.params.iter().any(|p| p.name == key) {
                    failure.unknown_fields.push(key.clone());
                    failure.push(key, "unknown parameter".to_owned());
                }
            }
        }

        if failure.missing_fields.is_empty()
            && failure.unknown_fields.is_empty()
            && failure.errors.is_empty()
        {
            Ok(spec)
        } else {
            Err(ToolError::Invalid(failure))
        }
    }

    /// The `/api/schema` document consumed by the playground.
    pub fn schema() -> Value {
        json!({
            "tools": CATALOG.iter().map(tool_doc).collect::<Vec<_>>(),
        })
    }

    /// The `/tools/{name}` document.
    pub fn doc(spec: &ToolSpec) -> Value {
        tool_doc(spec)
    }

    /// The `/tools` listing.
    pub fn listing() -> Value {
        json!({
            "success": true,
            "tools": CATALOG
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description}))
                .collect::<Vec<_>>(),
        })
    }
}

fn tool_doc(spec: &ToolSpec) -> Value {
    json!({
        "name": spec.name,
        "description": spec.description,
        "params": spec.params.iter().map(|p| {
            let mut doc = json!({
                "name": p.name,
                "type": p.ty.name(),
                "required": p.required,
            });
            if let ParamType::Enum(choices) = p.ty {
                doc["choices"] = json!(choices);
            }
            doc
        }).collect::<Vec<_>>(),
    })
}

fn supported_fields(spec: &ToolSpec) -> String {
    if spec.params.is_empty() {
        return "none".to_owned();
    }
    spec.params
        .iter()
        .map(|p| {
            format!(
                "{} ({}{})",
                p.name,
                p.ty.name(),
                if p.required { ", required" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use super::{ToolError, ToolRegistry, MAX_FIELD_ERRORS};
    use serde_json::json;

    #[test]
    fn valid_params_resolve_to_engine_method() {
        let spec = ToolRegistry::validate(
            "browser_navigate",
            &json!({"context_id": "ctx_1", "url": "https://example.com"}),
        )
        .unwrap();
        assert_eq!("navigate", spec.method);
    }

    #[test]
    fn missing_required_fields_are_listed_in_order() {
        let err = ToolRegistry::validate("browser_type", &json!({"context_id": "ctx_1"}));
        match err {
            Err(ToolError::Invalid(failure)) => {
                assert_eq!(vec!["selector", "text"], failure.missing_fields);
                assert!(failure.supported_fields.contains("selector"));
                assert!(failure.supported_fields.contains("text"));
                assert!(failure.errors.len() >= 2);
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tool_reports_supported_tools() {
        match ToolRegistry::validate("browser_frobnicate", &json!({})) {
            Err(ToolError::Unknown(hint)) => {
                assert!(hint.contains("browser_frobnicate"));
                assert!(hint.contains("browser_navigate"));
            }
            other => panic!("expected unknown-tool error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_flagged() {
        match ToolRegistry::validate(
            "browser_navigate",
            &json!({"context_id": "c", "url": "u", "turbo": true}),
        ) {
            Err(ToolError::Invalid(failure)) => {
                assert_eq!(vec!["turbo"], failure.unknown_fields);
                assert!(failure.missing_fields.is_empty());
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn type_and_enum_violations_are_reported() {
        match ToolRegistry::validate(
            "browser_get_content",
            &json!({"context_id": "c", "format": "pdf"}),
        ) {
            Err(ToolError::Invalid(failure)) => {
                assert_eq!("format", failure.errors[0].field);
                assert!(failure.errors[0].message.contains("html"));
            }
            other => panic!("expected enum failure, got {other:?}"),
        }

        match ToolRegistry::validate(
            "browser_wait",
            &json!({"context_id": "c", "ms": "100"}),
        ) {
            Err(ToolError::Invalid(failure)) => {
                assert!(failure.errors[0].message.contains("int"));
            }
            other => panic!("expected type failure, got {other:?}"),
        }
    }

    #[test]
    fn null_params_pass_when_nothing_is_required() {
        assert!(ToolRegistry::validate("browser_list_contexts", &serde_json::Value::Null).is_ok());
    }

    #[test]
    fn structured_errors_are_capped() {
        let mut body = serde_json::Map::new();
        body.insert("context_id".to_owned(), json!("c"));
        body.insert("url".to_owned(), json!("u"));
        for i in 0..50 {
            body.insert(format!("junk_{i}"), json!(i));
        }
        match ToolRegistry::validate("browser_navigate", &serde_json::Value::Object(body)) {
            Err(ToolError::Invalid(failure)) => {
                assert_eq!(50, failure.unknown_fields.len());
                assert_eq!(MAX_FIELD_ERRORS, failure.errors.len());
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn license_alias_resolves_with_browser_prefix() {
        let spec = ToolRegistry::lookup("browser_add_license").unwrap();
        assert_eq!("add_license", spec.name);
        assert!(ToolRegistry::lookup("browser_turbo_mode").is_none());
    }

    #[test]
    fn every_catalog_entry_appears_in_schema() {
        let schema = ToolRegistry::schema();
        let tools = schema["tools"].as_array().unwrap();
        assert_eq!(ToolRegistry::all().len(), tools.len());
    }
}
