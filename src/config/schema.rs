// src/config/schema.rs

use serde_json::{json, Value};

/// Get JSON schema for agent configuration validation
pub fn get_agent_config_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["cache", "network", "firewall", "storage", "logging"],
        "properties": {
            "cache": {
                "type": "object",
                "required": ["directory"],
                "properties": {
                    "directory": {
                        "type": "string",
                        "minLength": 1
                    }
                }
            },
            "network": {
                "type": "object",
                "required": ["external_bridge", "public_bridge", "private_bridge", "vpc_bridge"],
                "properties": {
                    "external_bridge": { "$ref": "#/definitions/ifname" },
                    "public_bridge": { "$ref": "#/definitions/ifname" },
                    "private_bridge": { "$ref": "#/definitions/ifname" },
                    "vpc_bridge": { "$ref": "#/definitions/ifname" }
                }
            },
            "firewall": {
                "type": "object",
                "required": [
                    "in_chain_prefix",
                    "out_chain_prefix",
                    "insert_line",
                    "chain_suffix",
                    "state_file",
                    "state_timeout_secs",
                    "poll_interval_ms"
                ],
                "properties": {
                    "in_chain_prefix": { "$ref": "#/definitions/chain_prefix" },
                    "out_chain_prefix": { "$ref": "#/definitions/chain_prefix" },
                    "insert_line": {
                        "type": "integer",
                        "minimum": 1
                    },
                    "chain_suffix": {
                        "type": "string",
                        "pattern": "^[A-Za-z0-9_-]*$"
                    },
                    "state_file": {
                        "type": "string",
                        "minLength": 1
                    },
                    "state_timeout_secs": {
                        "type": "integer",
                        "minimum": 1
                    },
                    "poll_interval_ms": {
                        "type": "integer",
                        "minimum": 1
                    }
                }
            },
            "storage": {
                "type": "object",
                "required": ["backup_pool_pattern"],
                "properties": {
                    "backup_pool_pattern": {
                        "type": "string",
                        "minLength": 1
                    }
                }
            },
            "logging": {
                "type": "object",
                "required": ["level", "format"],
                "properties": {
                    "level": {
                        "type": "string",
                        "minLength": 1
                    },
                    "format": {
                        "type": "string",
                        "enum": ["plain", "json"]
                    }
                }
            }
        },
        "definitions": {
            "ifname": {
                "type": "string",
                "pattern": "^[A-Za-z0-9_.-]{1,15}$"
            },
            "chain_prefix": {
                "type": "string",
                "pattern": "^[A-Za-z0-9_-]{1,16}$"
            }
        }
    })
}

/// Validate configuration against JSON schema
pub fn validate_config_against_schema(config_json: &Value) -> Result<(), String> {
    let schema = get_agent_config_schema();

    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|e| format!("Failed to compile schema: {}", e))?;

    let result = compiled.validate(config_json).map_err(|errors| {
        let error_msgs: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        error_msgs.join(", ")
    });
    result
}
