//! Wire grammar for the index protocol: request parsing and response codes.
//!
//! A request is a single line `<command>|<name>|<dep1>,<dep2>,...` with the
//! second `|` mandatory even when no dependencies follow. Parsing is a pure
//! function over the line bytes; nothing here touches the store.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ServiceError, ServiceResult};

/// The full line grammar, compiled once per process. Commands and names are
/// runs of non-`|` bytes; everything after the second separator is the raw
/// dependency list. No whitespace trimming anywhere: spaces and `\r` are
/// ordinary name bytes.
static REQUEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<cmd>[^|]+)\|(?P<name>[^|]+)\|(?P<deps>.*)$").unwrap());

/// Index protocol commands. Matching is case-sensitive: only the exact
/// uppercase literals are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Index,
    Remove,
    Query,
}

/// One parsed request line, owned by the handler that parsed it and consumed
/// by a single store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub name: String,
    /// Dependency tokens in wire order. Parsed for every command; the store
    /// ignores them for QUERY and REMOVE and dedupes them for INDEX.
    pub dependencies: Vec<String>,
}

/// The three single-line answers a framed request can get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Operation succeeded (INDEX accepted, REMOVE done or absent, QUERY hit).
    Ok,
    /// Operation semantically refused (missing deps, live dependents, QUERY miss).
    Fail,
    /// The frame was malformed or unparseable.
    Error,
}

impl Response {
    pub fn as_line(&self) -> &'static str {
        match self {
            Response::Ok => "OK\n",
            Response::Fail => "FAIL\n",
            Response::Error => "ERROR\n",
        }
    }
}

/// Parse one request line (without its trailing newline).
pub fn parse(line: &str) -> ServiceResult<Request> {
    if line.is_empty() {
        return Err(ServiceError::malformed("empty request line"));
    }
    let caps = REQUEST_RE
        .captures(line)
        .ok_or_else(|| ServiceError::malformed(format!("unparseable request {:?}", line)))?;

    let command = match &caps["cmd"] {
        "INDEX" => Command::Index,
        "REMOVE" => Command::Remove,
        "QUERY" => Command::Query,
        other => {
            return Err(ServiceError::malformed(format!("unknown command {:?}", other)));
        }
    };

    let name = caps["name"].to_string();
    let raw_deps = &caps["deps"];
    let dependencies = if raw_deps.is_empty() {
        Vec::new()
    } else {
        raw_deps.split(',').map(str::to_string).collect()
    };

    Ok(Request { command, name, dependencies })
}
