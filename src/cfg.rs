use std::{fmt, path::Path, str::FromStr};

use crate::error::{ModelError, Result};

/// One `[section]` of a darknet style cfg file.
///
/// Values are stored as the raw strings found in the file and converted on
/// demand, so a spec can be inspected before the builder decides which keys
/// its layer type needs. Key order is preserved.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSpec {
    kind: String,
    fields: Vec<(String, String)>,
}

impl LayerSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// Builder style setter, mostly useful when assembling specs in code.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn require(&self, key: &str) -> std::result::Result<&str, String> {
        self.get(key).ok_or_else(|| format!("missing required key '{key}'"))
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> std::result::Result<T, String> {
        let raw = self.require(key)?;
        raw.trim()
            .parse()
            .map_err(|_| format!("key '{key}' expects a number, found '{raw}'"))
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> std::result::Result<T, String> {
        if self.contains(key) {
            self.parse(key)
        } else {
            Ok(default)
        }
    }

    /// Darknet switches are written as `0`/`1`; a missing key is off.
    pub fn flag(&self, key: &str) -> std::result::Result<bool, String> {
        Ok(self.parse_or::<i64>(key, 0)? != 0)
    }

    pub fn list<T: FromStr>(&self, key: &str) -> std::result::Result<Vec<T>, String> {
        let raw = self.require(key)?;
        raw.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse()
                    .map_err(|_| format!("key '{key}' expects a list of numbers, found '{raw}'"))
            })
            .collect()
    }

    /// Parses an inclusive `start-end` range such as `mask = 0-2`.
    pub fn range(&self, key: &str) -> std::result::Result<(usize, usize), String> {
        let raw = self.require(key)?;
        let bounds = raw
            .split('-')
            .map(|v| v.trim().parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| format!("key '{key}' expects a 'start-end' range, found '{raw}'"))?;

        match bounds.as_slice() {
            [start, end] if start <= end => Ok((*start, *end)),
            [start, end] => Err(format!(
                "key '{key}' range start {start} is greater than its end {end}"
            )),
            _ => Err(format!(
                "key '{key}' expects a 'start-end' range, found '{raw}'"
            )),
        }
    }

    /// Parses a `(y,x)` pair, e.g. the dilation of a `d-convolutional` layer.
    pub fn pair(&self, key: &str) -> std::result::Result<[usize; 2], String> {
        let raw = self.require(key)?;
        let inner = raw.trim().trim_start_matches('(').trim_end_matches(')');
        let values = inner
            .split(',')
            .map(|v| v.trim().parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| format!("key '{key}' expects a '(a,b)' pair, found '{raw}'"))?;

        match values.as_slice() {
            [a, b] => Ok([*a, *b]),
            [a] => Ok([*a, *a]),
            _ => Err(format!("key '{key}' expects a '(a,b)' pair, found '{raw}'")),
        }
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}]", self.kind)?;
        for (k, v) in self.fields.iter() {
            writeln!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// Parses darknet cfg text into an ordered list of layer specs.
///
/// The first section is expected to be `[net]` (or `[network]`), which holds the
/// global hyperparameters. Blank lines and lines starting with `#` or `;` are
/// ignored.
pub fn parse_cfg(text: &str) -> Result<Vec<LayerSpec>> {
    let mut specs: Vec<LayerSpec> = Vec::new();

    for (n, line) in text.lines().enumerate() {
        let line_no = n + 1;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[') {
            let kind = section.strip_suffix(']').ok_or_else(|| ModelError::Parse {
                line: line_no,
                message: format!("unterminated section header '{line}'"),
            })?;
            specs.push(LayerSpec::new(kind.trim()));
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ModelError::Parse {
            line: line_no,
            message: format!("expected 'key=value', found '{line}'"),
        })?;

        let spec = specs.last_mut().ok_or_else(|| ModelError::Parse {
            line: line_no,
            message: format!("'{}' appears before any section header", key.trim()),
        })?;

        spec.set(key.trim(), value.trim());
    }

    match specs.first() {
        None => Err(ModelError::Parse {
            line: 0,
            message: "cfg contains no sections".into(),
        }),
        Some(net) if !matches!(net.kind(), "net" | "network") => Err(ModelError::Parse {
            line: 0,
            message: format!("first section must be [net], found [{}]", net.kind()),
        }),
        Some(_) => Ok(specs),
    }
}

pub fn load_cfg(path: impl AsRef<Path>) -> Result<Vec<LayerSpec>> {
    let text = std::fs::read_to_string(path)?;
    parse_cfg(&text)
}
