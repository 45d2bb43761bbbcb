//! Browser driver protocol and the step grammar that maps onto it
//!
//! Steps carry free-form text (`click #submit`, `#cart contains 3 items`).
//! The parsers here turn that text into typed [`DriverCommand`]s which are
//! sent to the driver process as one JSON object per line.

use serde::{Deserialize, Serialize};

use tandem_common::{Error, Result, Viewport};

/// One request to the browser driver process
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DriverCommand {
    Launch {
        browser: String,
        headless: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        viewport: Option<Viewport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
        has_touch: bool,
        is_mobile: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_scale_factor: Option<f64>,
    },
    Goto { url: String },
    Click { selector: String },
    Fill { selector: String, value: String },
    Type { text: String },
    Press { key: String },
    Hover { selector: String },
    Select { selector: String, value: String },
    Check { selector: String },
    Uncheck { selector: String },
    ScrollTo { selector: String },
    Evaluate { script: String },
    Sleep { ms: u64 },
    WaitForSelector { selector: String, state: WaitState, timeout_ms: u64 },
    WaitForText { text: String, timeout_ms: u64 },
    WaitForUrl { fragment: String, timeout_ms: u64 },
    AssertVisible { selector: String, timeout_ms: u64 },
    AssertHidden { selector: String, timeout_ms: u64 },
    AssertText { selector: String, text: String, timeout_ms: u64 },
    AssertUrl { fragment: String },
    AssertTitle { title: String },
    ExtractText { selector: String },
    ExtractAttribute { selector: String, attribute: String },
    ExtractUrl,
    ExtractTitle,
    Screenshot { path: String },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Visible,
    Hidden,
}

/// Request envelope written to the driver
#[derive(Debug, Serialize)]
pub struct DriverRequest<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub command: &'a DriverCommand,
}

/// Response line read back from the driver
#[derive(Debug, Clone, Deserialize)]
pub struct DriverResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Parse a free-form action instruction
pub fn parse_action(instruction: &str) -> Result<DriverCommand> {
    let text = instruction.trim();
    let (verb, rest) = split_verb(text);

    let command = match verb.to_ascii_lowercase().as_str() {
        "click" | "tap" => DriverCommand::Click {
            selector: required(rest, text)?,
        },
        "fill" => {
            let (selector, value) = rest
                .split_once(" with ")
                .ok_or_else(|| unsupported(text, "expected `fill <selector> with <text>`"))?;
            DriverCommand::Fill {
                selector: required(selector, text)?,
                value: value.to_string(),
            }
        }
        "type" => DriverCommand::Type {
            text: required(rest, text)?,
        },
        "press" => DriverCommand::Press {
            key: required(rest, text)?,
        },
        "hover" => DriverCommand::Hover {
            selector: required(rest, text)?,
        },
        "select" => {
            let (selector, value) = rest
                .split_once(" option ")
                .ok_or_else(|| unsupported(text, "expected `select <selector> option <value>`"))?;
            DriverCommand::Select {
                selector: required(selector, text)?,
                value: value.trim().to_string(),
            }
        }
        "check" => DriverCommand::Check {
            selector: required(rest, text)?,
        },
        "uncheck" => DriverCommand::Uncheck {
            selector: required(rest, text)?,
        },
        "scroll" => {
            let selector = rest.strip_prefix("to ").unwrap_or(rest);
            DriverCommand::ScrollTo {
                selector: required(selector, text)?,
            }
        }
        "eval" | "evaluate" => DriverCommand::Evaluate {
            script: required(rest, text)?,
        },
        "goto" | "open" => DriverCommand::Goto {
            url: required(rest, text)?,
        },
        _ => return Err(unsupported(text, "unknown action")),
    };

    Ok(command)
}

/// Parse an assertion
pub fn parse_assertion(assertion: &str, timeout_ms: u64) -> Result<DriverCommand> {
    let text = assertion.trim();

    if let Some(fragment) = text.strip_prefix("url contains ") {
        return Ok(DriverCommand::AssertUrl {
            fragment: required(fragment, text)?,
        });
    }
    if let Some(title) = text.strip_prefix("title is ") {
        return Ok(DriverCommand::AssertTitle {
            title: required(title, text)?,
        });
    }
    if let Some(selector) = text.strip_prefix("visible ") {
        return Ok(DriverCommand::AssertVisible {
            selector: required(selector, text)?,
            timeout_ms,
        });
    }
    if let Some(selector) = text.strip_prefix("hidden ") {
        return Ok(DriverCommand::AssertHidden {
            selector: required(selector, text)?,
            timeout_ms,
        });
    }
    if let Some((selector, expected)) = text.split_once(" contains ") {
        return Ok(DriverCommand::AssertText {
            selector: required(selector, text)?,
            text: expected.to_string(),
            timeout_ms,
        });
    }

    Ok(DriverCommand::AssertVisible {
        selector: required(text, text)?,
        timeout_ms,
    })
}

/// Parse a wait condition
pub fn parse_wait(condition: &str, timeout_ms: u64) -> DriverCommand {
    let text = condition.trim();

    if let Some(ms) = parse_duration_ms(text) {
        return DriverCommand::Sleep { ms };
    }
    if let Some(expected) = text.strip_prefix("text=") {
        return DriverCommand::WaitForText {
            text: expected.to_string(),
            timeout_ms,
        };
    }
    if let Some(fragment) = text.strip_prefix("url contains ") {
        return DriverCommand::WaitForUrl {
            fragment: fragment.trim().to_string(),
            timeout_ms,
        };
    }
    if let Some(selector) = text.strip_prefix("hidden ") {
        return DriverCommand::WaitForSelector {
            selector: selector.trim().to_string(),
            state: WaitState::Hidden,
            timeout_ms,
        };
    }

    DriverCommand::WaitForSelector {
        selector: text.to_string(),
        state: WaitState::Visible,
        timeout_ms,
    }
}

/// Parse an export query
pub fn parse_export(query: &str) -> DriverCommand {
    let text = query.trim();
    match text {
        "url" => DriverCommand::ExtractUrl,
        "title" => DriverCommand::ExtractTitle,
        _ => match text.rsplit_once('@') {
            Some((selector, attribute)) if !selector.is_empty() && is_attribute_name(attribute) => {
                DriverCommand::ExtractAttribute {
                    selector: selector.to_string(),
                    attribute: attribute.to_string(),
                }
            }
            _ => DriverCommand::ExtractText {
                selector: text.to_string(),
            },
        },
    }
}

fn split_verb(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (text, ""),
    }
}

fn required(value: &str, instruction: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        Err(unsupported(instruction, "missing argument"))
    } else {
        Ok(value.to_string())
    }
}

fn unsupported(instruction: &str, reason: &str) -> Error {
    Error::Driver(format!("unsupported instruction '{}': {}", instruction, reason))
}

fn parse_duration_ms(text: &str) -> Option<u64> {
    if let Some(ms) = text.strip_suffix("ms") {
        return ms.trim().parse().ok();
    }
    text.strip_suffix('s')
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|s| s.saturating_mul(1000))
}

fn is_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
}
