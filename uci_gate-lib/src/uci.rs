use std::collections::BTreeMap;

/// Sentinel policy value. An option carrying it is never pushed by the
/// server and the client's own `setoption` line passes through untouched.
pub const OVERRIDE_SENTINEL: &str = "override";

/// A client line matching the positional grammar
/// `setoption name <NAME> value <REST>`.
///
/// The recognizer is deliberately dumb: token `name` at position 1, token
/// `value` at position 3, NAME a single token. Anything else is an opaque
/// line for the proxy and gets forwarded verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetOption<'a> {
    pub name: &'a str,
    pub value: String,
}

pub fn parse_setoption(line: &str) -> Option<SetOption<'_>> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() >= 5 && parts[0] == "setoption" && parts[1] == "name" && parts[3] == "value" {
        Some(SetOption {
            name: parts[2],
            value: parts[4..].join(" "),
        })
    } else {
        None
    }
}

/// Server-side option policy for one engine: the engine-local map always
/// wins over the global map.
#[derive(Clone, Debug, Default)]
pub struct OptionPolicy {
    engine: BTreeMap<String, String>,
    global: BTreeMap<String, String>,
}

impl OptionPolicy {
    pub fn new(engine: BTreeMap<String, String>, global: BTreeMap<String, String>) -> Self {
        OptionPolicy { engine, global }
    }

    /// Options the server pushes during the handshake: the merged map with
    /// engine-local entries taking precedence, sentinel entries skipped.
    pub fn handshake_options(&self) -> Vec<(&str, &str)> {
        let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, value) in &self.global {
            merged.insert(name, value);
        }
        for (name, value) in &self.engine {
            merged.insert(name, value);
        }
        merged
            .into_iter()
            .filter(|(_, value)| *value != OVERRIDE_SENTINEL)
            .collect()
    }

    /// Policy value a client `setoption` for `name` must be rewritten to.
    /// `None` means the client's line is forwarded verbatim.
    fn resolve(&self, name: &str) -> Option<&str> {
        match self.engine.get(name) {
            Some(value) if value == OVERRIDE_SENTINEL => None,
            Some(value) => Some(value),
            None => self.global.get(name).map(String::as_str),
        }
    }

    /// Apply the rewrite policy to one client line. Returns the replacement
    /// line, or `None` when the line is not a recognizable `setoption` or
    /// the policy lets it through.
    pub fn rewrite_line(&self, line: &str) -> Option<String> {
        let opt = parse_setoption(line)?;
        let value = self.resolve(opt.name)?;
        Some(format!("setoption name {} value {}", opt.name, value))
    }
}
