use std::time::Duration;

use crate::query::{AccessMode, Parameters};
use crate::value::ParamValue;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Health,
    Verify,
    Query {
        template: String,
        params: Parameters,
        mode: AccessMode,
    },
    InitSchema,
    Status,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandLineConfig {
    /// Overrides `NEO4J_URI` when set.
    pub endpoint: Option<String>,
    pub log_level: String,
    pub timeout: Option<Duration>,
    pub command: Command,
}

impl CommandLineConfig {
    pub fn from_args(args: &[&str]) -> Result<Self, String> {
        let mut endpoint = None;
        let mut log_level = String::from("warn");
        let mut timeout = None;
        let mut command_name: Option<String> = None;
        let mut positional = Vec::new();
        let mut params = Parameters::new();
        let mut mode = AccessMode::Read;

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match *arg {
                "--endpoint" | "--db" => {
                    endpoint = Some(
                        iter.next()
                            .ok_or_else(|| "--endpoint requires a value".to_string())?
                            .to_string(),
                    );
                }
                "--log-level" => {
                    log_level = iter
                        .next()
                        .ok_or_else(|| "--log-level requires a value".to_string())?
                        .to_string();
                }
                "--timeout-ms" => {
                    let raw = iter
                        .next()
                        .ok_or_else(|| "--timeout-ms requires a value".to_string())?;
                    let ms: u64 = raw
                        .parse()
                        .map_err(|_| format!("--timeout-ms expects milliseconds, got {raw}"))?;
                    timeout = Some(Duration::from_millis(ms));
                }
                "--param" => {
                    let raw = iter
                        .next()
                        .ok_or_else(|| "--param requires name=value".to_string())?;
                    let (name, value) = parse_param(raw)?;
                    params.insert(name, value);
                }
                "--write" => mode = AccessMode::Write,
                other if other.starts_with('-') => {
                    return Err(format!("unknown flag {other}"));
                }
                _ if command_name.is_none() => command_name = Some(arg.to_string()),
                _ => positional.push(arg.to_string()),
            }
        }

        let name = command_name.unwrap_or_else(|| "status".to_string());
        let takes_query_flags = name == "query";
        if !takes_query_flags && (!params.is_empty() || mode == AccessMode::Write) {
            return Err(format!("--param and --write only apply to query, not {name}"));
        }
        let command = match name.as_str() {
            "health" => Command::Health,
            "verify" => Command::Verify,
            "init-schema" => Command::InitSchema,
            "status" => Command::Status,
            "query" => {
                let mut positional = positional.into_iter();
                let template = positional
                    .next()
                    .ok_or_else(|| "query requires a template".to_string())?;
                if let Some(extra) = positional.next() {
                    return Err(format!("unexpected argument {extra}"));
                }
                return Ok(Self {
                    endpoint,
                    log_level,
                    timeout,
                    command: Command::Query {
                        template,
                        params,
                        mode,
                    },
                });
            }
            other => return Err(format!("unknown command {other}")),
        };
        if let Some(extra) = positional.first() {
            return Err(format!("unexpected argument {extra}"));
        }
        Ok(Self {
            endpoint,
            log_level,
            timeout,
            command,
        })
    }

    pub fn help() -> &'static str {
        "Usage: graph-db-api [--endpoint URI] [--log-level LEVEL] [--timeout-ms N] COMMAND\n\
         \n\
         Commands:\n  \
           health                      ping the database, report latency\n  \
           verify                      open a fresh connection and report connectivity\n  \
           query TEMPLATE [--param name=json]... [--write]\n  \
           init-schema                 create or upgrade the graph tables\n  \
           status                      pool and health summary (default)\n\
         \n\
         Connection settings come from NEO4J_URI, NEO4J_USERNAME, NEO4J_PASSWORD,\n\
         NEO4J_DATABASE and GRAPH_DB_* variables; --endpoint overrides NEO4J_URI.\n"
    }
}

/// `name=value` where value is JSON; anything that is not valid JSON is a string.
fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("--param expects name=value, got {raw}"))?;
    let name = name.trim_start_matches('$');
    if name.is_empty() {
        return Err(format!("--param has an empty name in {raw}"));
    }
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(json) => ParamValue::from(json),
        Err(_) => ParamValue::String(value.to_string()),
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_status() {
        let cfg = CommandLineConfig::from_args(&["graph-db-api"]).unwrap();
        assert_eq!(cfg.command, Command::Status);
        assert_eq!(cfg.log_level, "warn");
        assert!(cfg.endpoint.is_none());
    }

    #[test]
    fn test_query_with_params() {
        let cfg = CommandLineConfig::from_args(&[
            "graph-db-api",
            "--endpoint",
            "sqlite:///tmp/g.db",
            "query",
            "SELECT $n AS n, $tags AS tags, $who AS who",
            "--param",
            "n=3",
            "--param",
            "tags=[\"a\",\"b\"]",
            "--param",
            "$who=Ada",
            "--write",
        ])
        .unwrap();
        assert_eq!(cfg.endpoint.as_deref(), Some("sqlite:///tmp/g.db"));
        let Command::Query {
            params, mode, ..
        } = cfg.command
        else {
            panic!("expected query");
        };
        assert_eq!(mode, AccessMode::Write);
        assert_eq!(params["n"], ParamValue::Integer(3));
        assert_eq!(params["who"], ParamValue::String("Ada".into()));
        assert!(matches!(params["tags"], ParamValue::List(_)));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(CommandLineConfig::from_args(&["graph-db-api", "--bogus"]).is_err());
        assert!(CommandLineConfig::from_args(&["graph-db-api", "query"]).is_err());
        assert!(CommandLineConfig::from_args(&["graph-db-api", "health", "--write"]).is_err());
        assert!(CommandLineConfig::from_args(&["graph-db-api", "dance"]).is_err());
        assert!(
            CommandLineConfig::from_args(&["graph-db-api", "query", "RETURN 1", "--param", "x"])
                .is_err()
        );
    }
}
