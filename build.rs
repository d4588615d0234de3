use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// ====================================================================================
// Source policy checks
// ====================================================================================
//
// Every crate source file is scanned before compilation. A violation prints the
// offending lines with their line numbers and fails the build.

/// One kind of violation: a line regex plus a filter on the matching lines.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    guidance: &'static str,
    accept: fn(&str) -> bool,
    include_build_script: bool,
}

const FORBIDDEN_WORDS: &str = r"(//|/\*).*\b(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)\b";

const RULES: &[Rule] = &[
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        guidance: "Use the binding or remove it. Underscore prefixes are not allowed.",
        accept: underscore_in_code,
        include_build_script: true,
    },
    Rule {
        name: "changelog words in comments",
        pattern: FORBIDDEN_WORDS,
        guidance: "Comments describe the code as it is, not how it came to be.",
        accept: any_line,
        include_build_script: false,
    },
    Rule {
        name: "emphasis markers in comments",
        pattern: r"(//|/\*).*\*\*",
        guidance: "Bold markers belong in doc comments only.",
        accept: stars_outside_doc_comment,
        include_build_script: false,
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        guidance: "Write comments in sentence case.",
        accept: shouting_comment,
        include_build_script: false,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        guidance: "Use the code or delete it.",
        accept: any_line,
        include_build_script: false,
    },
];

/// Sink that keeps every matching line the rule accepts, formatted as `line:text`.
struct ViolationCollector {
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn any_line(_: &str) -> bool {
    true
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(index) = line.find("//") {
        return Some(line[index + 2..].trim());
    }
    let index = line.find("/*")?;
    let body = &line[index + 2..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

fn underscore_in_code(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    // Identifiers inside string literals are text, not bindings.
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(index, part)| index % 2 == 1 && part.contains('_'));
    !in_string
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn shouting_comment(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn crate_sources() -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|entry| {
            let path = entry.path();
            !path.starts_with("./target") && !path.starts_with("./examples")
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect()
}

fn check_rule(rule: &Rule, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in sources {
        if !rule.include_build_script && path == Path::new("./build.rs") {
            continue;
        }
        let mut collector = ViolationCollector {
            accept: rule.accept,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if collector.violations.is_empty() {
            continue;
        }

        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            collector.violations.len(),
            rule.name,
            path.display()
        );
        for violation in &collector.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", rule.guidance));
        return Err(message.into());
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in ["precision", "parallel", "blup", "tests", "benches"] {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = crate_sources();
    for rule in RULES {
        if let Err(e) = check_rule(rule, &sources) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
