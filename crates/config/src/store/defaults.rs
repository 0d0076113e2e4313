//! Builtin schemas and default documents for the standard sections.
//!
//! The four standard sections (`app`, `llm`, `ui`, `security`) ship with a
//! schema and a default document so a fresh install starts from a valid,
//! fully populated configuration.

use serde_json::{Map, Value, json};

/// Section names installed by [`ConfigStore::install_defaults`](super::ConfigStore::install_defaults).
pub const DEFAULT_SECTIONS: &[&str] = &["app", "llm", "ui", "security"];

pub fn builtin_schema(section: &str) -> Option<Value> {
    let schema = match section {
        "app" => json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 1},
                "version": {"type": "string", "pattern": r"^\d+\.\d+\.\d+$"},
                "debug": {"type": "boolean", "default": false},
                "log_level": {
                    "type": "string",
                    "enum": ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"],
                    "default": "INFO"
                }
            },
            "required": ["name", "version"]
        }),
        "llm" => json!({
            "type": "object",
            "properties": {
                "default_provider": {"type": "string", "minLength": 1},
                "default_model": {"type": "string", "minLength": 1},
                "timeout": {"type": "number", "minimum": 1.0, "maximum": 300.0},
                "retry_count": {"type": "integer", "minimum": 0, "maximum": 10},
                "providers": {
                    "type": "object",
                    "additionalProperties": false,
                    "patternProperties": {
                        "^[a-zA-Z][a-zA-Z0-9_]*$": {
                            "type": "object",
                            "properties": {
                                "enabled": {"type": "boolean"},
                                "api_key": {"type": "string"},
                                "base_url": {"type": "string"},
                                "models": {
                                    "type": "array",
                                    "items": {"type": "string"},
                                    "minItems": 1
                                }
                            }
                        }
                    }
                }
            },
            "required": ["default_provider", "providers"]
        }),
        "ui" => json!({
            "type": "object",
            "properties": {
                "theme": {
                    "type": "string",
                    "enum": ["light", "dark", "auto"],
                    "default": "light"
                },
                "language": {"type": "string", "default": "en"},
                "window": {
                    "type": "object",
                    "properties": {
                        "width": {"type": "integer", "minimum": 400},
                        "height": {"type": "integer", "minimum": 300},
                        "maximized": {"type": "boolean", "default": false}
                    }
                },
                "chat": {
                    "type": "object",
                    "properties": {
                        "font_size": {"type": "integer", "minimum": 8, "maximum": 24},
                        "font_family": {"type": "string"},
                        "auto_save": {"type": "boolean", "default": true},
                        "history_limit": {"type": "integer", "minimum": 10}
                    }
                }
            }
        }),
        "security" => json!({
            "type": "object",
            "properties": {
                "encryption_enabled": {"type": "boolean", "default": false},
                "api_key_encryption": {"type": "boolean", "default": true},
                "session_timeout": {"type": "integer", "minimum": 60},
                "max_login_attempts": {"type": "integer", "minimum": 1}
            }
        }),
        _ => return None,
    };
    Some(schema)
}

/// Full default document for a standard section, written to disk on first
/// run when no file exists yet.
pub fn default_document(section: &str) -> Option<Map<String, Value>> {
    let doc = match section {
        "app" => json!({
            "name": "Promptdesk",
            "version": "1.0.0",
            "debug": false,
            "log_level": "INFO"
        }),
        "llm" => json!({
            "default_provider": "openai",
            "default_model": "gpt-3.5-turbo",
            "timeout": 30.0,
            "retry_count": 3,
            "providers": {
                "openai": {
                    "api_key": "",
                    "base_url": "https://api.openai.com/v1",
                    "models": ["gpt-3.5-turbo", "gpt-4", "gpt-4-turbo"]
                },
                "claude": {
                    "api_key": "",
                    "base_url": "https://api.anthropic.com",
                    "models": ["claude-3-sonnet", "claude-3-haiku", "claude-3-opus"]
                }
            }
        }),
        "ui" => json!({
            "theme": "light",
            "language": "en",
            "window": {"width": 1200, "height": 800, "maximized": false},
            "chat": {
                "font_size": 12,
                "font_family": "Consolas",
                "auto_save": true,
                "history_limit": 1000
            }
        }),
        "security" => json!({
            "encryption_enabled": false,
            "api_key_encryption": true,
            "session_timeout": 3600,
            "max_login_attempts": 5
        }),
        _ => return None,
    };
    doc.as_object().cloned()
}
