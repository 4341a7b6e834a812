use crate::config::Config;
use crate::indexer::event::SymbolKey;
use crate::indexer::{Indexer, scan};
use crate::matcher::GroupMatch;
use crate::model::{Role, Usr};
use crate::query;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    message: String,
}

/// Symbol addressed by hashed usr or by its USR text.
#[derive(Deserialize)]
struct SymbolParams {
    usr: SymbolKey,
}

#[derive(Deserialize)]
struct UsesParams {
    usr: SymbolKey,
    /// Keep only uses carrying at least one of these roles.
    roles: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct FindSymbolParams {
    query: String,
    limit: Option<usize>,
    include_locals: Option<bool>,
    /// Location path patterns a hit must match.
    paths: Option<Vec<String>>,
    /// Location path patterns that reject a hit.
    exclude_paths: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize, Default)]
struct ReindexParams {
    unit: Option<String>,
}

#[derive(Deserialize, Default)]
struct ListMethodsParams {
    format: Option<String>,
}

const METHOD_LIST: &[&str] = &[
    // -- Lookup --
    "lookup",
    "find_symbol",
    "resolve_alias",
    // -- Cross references --
    "uses",
    "declarations",
    "callers",
    "callees",
    "bases",
    "derived",
    "instances",
    "members",
    // -- Files --
    "file_symbols",
    "file_info",
    // -- Index state --
    "overview",
    "units",
    "conflicts",
    "pipeline_stats",
    "reindex",
    "help",
    "list_methods",
];

struct MethodDoc {
    name: &'static str,
    summary: &'static str,
    key_params: &'static [&'static str],
}

const METHOD_DOCS: &[MethodDoc] = &[
    MethodDoc {
        name: "help",
        summary: "Show RPC help and examples.",
        key_params: &[],
    },
    MethodDoc {
        name: "list_methods",
        summary: "List supported methods with short descriptions.",
        key_params: &["format (details|names)"],
    },
    MethodDoc {
        name: "lookup",
        summary: "Full record of one symbol: definition, declaration, hover, contributors.",
        key_params: &["usr (number or USR text)"],
    },
    MethodDoc {
        name: "find_symbol",
        summary: "Fuzzy symbol search over qualified names.",
        key_params: &["query", "limit", "include_locals", "paths", "exclude_paths"],
    },
    MethodDoc {
        name: "resolve_alias",
        summary: "Follow typedef/using aliases to the underlying type.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "uses",
        summary: "All recorded uses, optionally filtered by role.",
        key_params: &["usr", "roles (e.g. [\"call\", \"write\"])"],
    },
    MethodDoc {
        name: "declarations",
        summary: "Every declaration site of a symbol.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "callers",
        summary: "Functions calling a function, with call sites.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "callees",
        summary: "Functions called by a function, with call sites.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "bases",
        summary: "Base types, or overridden functions.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "derived",
        summary: "Derived types, or overriding functions.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "instances",
        summary: "Variables whose type is the given type.",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "members",
        summary: "Member types, functions and variables (enumerators with values).",
        key_params: &["usr"],
    },
    MethodDoc {
        name: "file_symbols",
        summary: "Outline of a file ordered by position.",
        key_params: &["path"],
    },
    MethodDoc {
        name: "file_info",
        summary: "Units that touched a file, its skipped ranges and includes.",
        key_params: &["path"],
    },
    MethodDoc {
        name: "overview",
        summary: "Counts of units, files and entities.",
        key_params: &[],
    },
    MethodDoc {
        name: "units",
        summary: "Merged translation units with their pass ids.",
        key_params: &[],
    },
    MethodDoc {
        name: "conflicts",
        summary: "Kind conflicts found while linking units.",
        key_params: &[],
    },
    MethodDoc {
        name: "pipeline_stats",
        summary: "Indexing pipeline counters.",
        key_params: &[],
    },
    MethodDoc {
        name: "reindex",
        summary: "Re-index one unit, or every changed event file when no unit is given.",
        key_params: &["unit"],
    },
];

fn method_docs_json() -> Vec<Value> {
    METHOD_DOCS
        .iter()
        .map(|doc| {
            let mut entry = serde_json::Map::new();
            entry.insert("name".to_string(), Value::String(doc.name.to_string()));
            entry.insert(
                "summary".to_string(),
                Value::String(doc.summary.to_string()),
            );
            if !doc.key_params.is_empty() {
                entry.insert("key_params".to_string(), json!(doc.key_params));
            }
            Value::Object(entry)
        })
        .collect()
}

fn method_help() -> Value {
    json!({
        "summary": "cxref merges per-unit C/C++ index event files into one cross-reference store and answers queries over it.",
        "start_here": "Use find_symbol to get a usr, then lookup/uses/callers/callees on it.",
        "methods": method_docs_json(),
        "examples": [
            { "method": "find_symbol", "params": { "query": "Widget", "limit": 10 } },
            { "method": "uses", "params": { "usr": "c:@S@Widget", "roles": ["call"] } },
            { "method": "file_symbols", "params": { "path": "src/widget.h" } },
            { "method": "reindex", "params": { "unit": "src/widget.cc" } }
        ],
        "cli_examples": [
            "cxref index --root .",
            r#"cxref request --method find_symbol --params '{"query":"Widget"}'"#,
            r#"cxref request --method callers --params '{"usr":"c:@F@main#"}'"#,
            "cxref reindex --unit src/widget.cc",
            "cxref serve --root ."
        ]
    })
}

fn method_list(params: Value) -> Result<Value> {
    let params: ListMethodsParams = parse_optional(params)?;
    let format = params
        .format
        .as_deref()
        .unwrap_or("details")
        .trim()
        .to_ascii_lowercase();
    if format == "names" || format == "name" || format == "list" {
        return Ok(json!(METHOD_LIST));
    }
    Ok(json!({
        "methods": method_docs_json(),
        "names": METHOD_LIST,
    }))
}

/// Answers JSONL requests from stdin until it closes.
pub fn serve(repo_root: PathBuf, db_path: PathBuf, scan_options: scan::ScanOptions) -> Result<()> {
    let mut app = App::new(repo_root, db_path, scan_options)?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(value) => value,
            Err(err) => {
                warn!("stdin error: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => app.handle_request(request),
            Err(err) => error_response(Value::Null, &format!("invalid request: {err}")),
        };

        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }

    app.indexer.shutdown()
}

pub fn call(
    repo_root: PathBuf,
    db_path: PathBuf,
    method: String,
    params_raw: &str,
    id_raw: &str,
) -> Result<String> {
    let params: Value = serde_json::from_str(params_raw).with_context(|| "parse params JSON")?;
    let id = parse_value(id_raw);
    let mut app = App::new(repo_root, db_path, scan::ScanOptions::default())?;
    let request = RpcRequest { id, method, params };
    let response = app.handle_request(request);
    app.indexer.shutdown()?;
    Ok(serde_json::to_string(&response)?)
}

struct App {
    indexer: Indexer,
}

impl App {
    fn new(repo_root: PathBuf, db_path: PathBuf, scan_options: scan::ScanOptions) -> Result<Self> {
        let indexer = Indexer::new(repo_root, db_path)?.with_scan_options(scan_options);
        Ok(Self { indexer })
    }

    fn handle_request(&mut self, req: RpcRequest) -> RpcResponse {
        let id = req.id.clone();
        match handle_method(&mut self.indexer, &req.method, req.params) {
            Ok(value) => RpcResponse {
                id,
                result: Some(value),
                error: None,
            },
            Err(err) => error_response(id, &format!("{err:#}")),
        }
    }
}

pub fn handle_method(indexer: &mut Indexer, method: &str, params: Value) -> Result<Value> {
    let start = Instant::now();
    let value = match method {
        "help" => method_help(),
        "list_methods" => method_list(params)?,
        "reindex" => {
            let params: ReindexParams = parse_optional(params)?;
            match params.unit {
                Some(unit) => {
                    let pass = indexer.reindex_unit(&unit)?;
                    json!({ "unit": unit, "pass": pass })
                }
                None => json!(indexer.reindex()?),
            }
        }
        "pipeline_stats" => json!(indexer.pipeline().stats()),
        _ => query_method(indexer, method, params)?,
    };
    debug!(method, elapsed_ms = start.elapsed().as_millis() as u64, "handled request");
    Ok(value)
}

/// Read-only methods, answered from one consistent store snapshot.
fn query_method(indexer: &Indexer, method: &str, params: Value) -> Result<Value> {
    let store = indexer.store().read();
    let value = match method {
        "overview" => json!(query::overview(&store)),
        "units" => {
            let units: Vec<Value> = store
                .units()
                .into_iter()
                .map(|record| {
                    json!({
                        "unit": record.index.path,
                        "pass": record.pass,
                        "source": record.index.source,
                        "files": record.index.files.len(),
                        "malformed_events": record.index.malformed_events,
                    })
                })
                .collect();
            json!(units)
        }
        "conflicts" => json!(store.conflicts()),
        "lookup" => {
            let usr = symbol_usr(params)?;
            match query::lookup(&store, usr) {
                Some(view) => json!(view),
                None => json!(query::summary(&store, usr)),
            }
        }
        "find_symbol" => {
            let params: FindSymbolParams = serde_json::from_value(params)?;
            let limit = params.limit.unwrap_or(Config::get().search_limit);
            let include_locals = params.include_locals.unwrap_or(false);
            let filter = match (&params.paths, &params.exclude_paths) {
                (None, None) => None,
                (paths, excluded) => Some(GroupMatch::new(
                    paths.as_deref().unwrap_or_default(),
                    excluded.as_deref().unwrap_or_default(),
                )),
            };
            let hits = match filter {
                None => query::find_by_name(&store, &params.query, limit, include_locals)?,
                Some(filter) => {
                    let mut hits =
                        query::find_by_name(&store, &params.query, usize::MAX, include_locals)?;
                    hits.retain(|hit| match &hit.location {
                        Some(location) => filter.is_match(&location.path),
                        None => false,
                    });
                    hits.truncate(limit);
                    hits
                }
            };
            json!(hits)
        }
        "resolve_alias" => {
            let usr = symbol_usr(params)?;
            let chain: Vec<_> = query::resolve_alias(&store, usr)
                .into_iter()
                .map(|usr| query::summary(&store, usr))
                .collect();
            json!(chain)
        }
        "uses" => {
            let params: UsesParams = serde_json::from_value(params)?;
            let roles = match params.roles {
                Some(names) => Some(parse_roles(&names)?),
                None => None,
            };
            json!(query::uses(&store, params.usr.resolve(), roles))
        }
        "declarations" => json!(query::declarations(&store, symbol_usr(params)?)),
        "callers" => json!(query::callers(&store, symbol_usr(params)?)),
        "callees" => json!(query::callees(&store, symbol_usr(params)?)),
        "bases" => json!(query::bases(&store, symbol_usr(params)?)),
        "derived" => json!(query::derived(&store, symbol_usr(params)?)),
        "instances" => json!(query::instances(&store, symbol_usr(params)?)),
        "members" => json!(query::members(&store, symbol_usr(params)?)),
        "file_symbols" => {
            let params: PathParams = serde_json::from_value(params)?;
            json!(query::file_symbols(&store, &params.path))
        }
        "file_info" => {
            let params: PathParams = serde_json::from_value(params)?;
            match query::file_info(&store, &params.path) {
                Some(view) => json!(view),
                None => anyhow::bail!("unknown file: {}", params.path),
            }
        }
        _ => anyhow::bail!("unknown method: {method} (see list_methods)"),
    };
    Ok(value)
}

fn symbol_usr(params: Value) -> Result<Usr> {
    let params: SymbolParams =
        serde_json::from_value(params).with_context(|| "expected {\"usr\": number | string}")?;
    Ok(params.usr.resolve())
}

fn parse_roles(names: &[String]) -> Result<Role> {
    let mut roles = Role::NONE;
    for name in names {
        let Some(role) = Role::from_name(name.trim()) else {
            anyhow::bail!("unknown role: {name}");
        };
        roles |= role;
    }
    Ok(roles)
}

fn parse_optional<T: DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(params)?)
}

fn error_response(id: Value, message: &str) -> RpcResponse {
    RpcResponse {
        id,
        result: None,
        error: Some(RpcError {
            message: message.to_string(),
        }),
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_by_name() {
        let roles = parse_roles(&["call".to_string(), " write ".to_string()]).unwrap();
        assert!(roles.contains(Role::CALL));
        assert!(roles.contains(Role::WRITE));
        assert!(!roles.contains(Role::READ));
        assert!(parse_roles(&["teleport".to_string()]).is_err());
    }

    #[test]
    fn symbol_usr_accepts_hash_or_text() {
        assert_eq!(symbol_usr(json!({ "usr": 77 })).unwrap(), 77);
        assert_eq!(
            symbol_usr(json!({ "usr": "c:@S@Foo" })).unwrap(),
            crate::indexer::stable_id::usr_from_str("c:@S@Foo")
        );
        assert!(symbol_usr(json!({})).is_err());
    }

    #[test]
    fn method_docs_cover_method_list() {
        for name in METHOD_LIST {
            assert!(
                METHOD_DOCS.iter().any(|doc| doc.name == *name),
                "missing docs for {name}"
            );
        }
        assert_eq!(
            method_list(json!({ "format": "names" })).unwrap(),
            json!(METHOD_LIST)
        );
    }

    #[test]
    fn non_json_ids_become_strings() {
        assert_eq!(parse_value("7"), json!(7));
        assert_eq!(parse_value("abc"), json!("abc"));
    }
}
