//! Hierarchical IOS configuration diff

use std::collections::BTreeMap;

use regex::Regex;

/// Lines ignored by every diff: comments, session tweaks added by tooling,
/// PKI material and the `show running-config` framing.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    r"^!",
    r"^exec-timeout",
    r"^no logging console",
    r"^login local",
    r"^crypto pki certificate chain",
    r"^service password-encryption",
    r"^crypto pki trustpoint",
    r"^Building configuration",
    r"^Current configuration",
    r"^end$",
];

/// Compiled exclusion patterns, matched against trimmed lines at every depth
#[derive(Debug, Clone)]
pub struct DiffExcludes {
    patterns: Vec<Regex>,
}

impl DiffExcludes {
    /// Built-in patterns plus `extra`
    pub fn new<S: AsRef<str>>(extra: &[S]) -> Result<Self, regex::Error> {
        let patterns = DEFAULT_EXCLUDES
            .iter()
            .map(|p| Regex::new(p))
            .chain(extra.iter().map(|p| Regex::new(p.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }
}

impl Default for DiffExcludes {
    fn default() -> Self {
        let patterns = DEFAULT_EXCLUDES
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns }
    }
}

/// One configuration line and the lines indented beneath it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBlock {
    children: BTreeMap<String, ConfigBlock>,
}

impl ConfigBlock {
    /// Parse indented configuration text. Repeated lines at one level merge.
    pub fn parse(text: &str) -> Self {
        let mut root = ConfigBlock::default();
        let mut stack: Vec<(usize, String, ConfigBlock)> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim_end();
            let trimmed = line.trim_start();
            if trimmed.is_empty() {
                continue;
            }
            let indent = line.len() - trimmed.len();

            while stack.last().is_some_and(|(depth, _, _)| *depth >= indent) {
                if let Some((_, key, block)) = stack.pop() {
                    attach(&mut root, &mut stack, key, block);
                }
            }
            stack.push((indent, trimmed.to_string(), ConfigBlock::default()));
        }
        while let Some((_, key, block)) = stack.pop() {
            attach(&mut root, &mut stack, key, block);
        }
        root
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, line: &str) -> Option<&ConfigBlock> {
        self.children.get(line)
    }

    fn merge(&mut self, other: ConfigBlock) {
        for (key, block) in other.children {
            self.children.entry(key).or_default().merge(block);
        }
    }
}

fn attach(
    root: &mut ConfigBlock,
    stack: &mut [(usize, String, ConfigBlock)],
    key: String,
    block: ConfigBlock,
) {
    let parent = match stack.last_mut() {
        Some((_, _, parent)) => parent,
        None => root,
    };
    parent.children.entry(key).or_default().merge(block);
}

/// Lines of `running` missing from `default` are `+`, the reverse `-`.
/// Shared parents of changed lines are printed unmarked for context.
/// An empty string means no difference.
pub fn diff(running: &ConfigBlock, default: &ConfigBlock, excludes: &DiffExcludes) -> String {
    let mut out = Vec::new();
    diff_into(running, default, excludes, 0, &mut out);
    out.join("\n")
}

fn diff_into(
    running: &ConfigBlock,
    default: &ConfigBlock,
    excludes: &DiffExcludes,
    depth: usize,
    out: &mut Vec<String>,
) {
    for (line, block) in &running.children {
        if excludes.is_excluded(line) {
            continue;
        }
        match default.children.get(line) {
            None => emit('+', line, block, excludes, depth, out),
            Some(other) => {
                let mut nested = Vec::new();
                diff_into(block, other, excludes, depth + 1, &mut nested);
                if !nested.is_empty() {
                    out.push(format!(" {}{}", indent(depth), line));
                    out.append(&mut nested);
                }
            }
        }
    }
    for (line, block) in &default.children {
        if excludes.is_excluded(line) || running.children.contains_key(line) {
            continue;
        }
        emit('-', line, block, excludes, depth, out);
    }
}

fn emit(
    sign: char,
    line: &str,
    block: &ConfigBlock,
    excludes: &DiffExcludes,
    depth: usize,
    out: &mut Vec<String>,
) {
    out.push(format!("{}{}{}", sign, indent(depth), line));
    for (child, nested) in &block.children {
        if !excludes.is_excluded(child) {
            emit(sign, child, nested, excludes, depth + 1, out);
        }
    }
}

fn indent(depth: usize) -> String {
    " ".repeat(depth)
}
