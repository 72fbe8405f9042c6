//! Schema module parsing
//!
//! The scheduler only needs a module's identity, imports, features and the
//! `if-feature` edges between them. [`SchemaParser`] is the seam to a full
//! YANG toolchain; [`YangParser`] reads that subset straight from source:
//!
//! ```text
//! module feature-deps {
//!   prefix fd;
//!   import feature-deps2 { prefix fd2; }
//!   revision 2019-01-31;
//!   feature feat1 { if-feature "fd2:featx"; }
//! }
//! ```
//!
//! Every other statement is parsed structurally and ignored. `if-feature`
//! expressions are limited to `and` conjunctions.

use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Result, SchedError};
use crate::revision::Revision;
use crate::schema::{Feature, FeatureRef, Import, Module};

/// Source of module metadata
pub trait SchemaParser: Send + Sync {
    /// Parse the module at `path`; all features come back disabled
    fn parse_module(&self, path: &Path) -> Result<Module>;
}

/// Parser for the YANG statements the scheduler consumes
pub struct YangParser {
    identifier: Regex,
    feature_ref: Regex,
}

impl Default for YangParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaParser for YangParser {
    fn parse_module(&self, path: &Path) -> Result<Module> {
        let source = fs::read_to_string(path)?;
        self.parse_str(&source, path)
    }
}

impl YangParser {
    pub fn new() -> Self {
        Self {
            identifier: Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap(),
            feature_ref: Regex::new(
                r"^(?:([A-Za-z_][A-Za-z0-9_.\-]*):)?([A-Za-z_][A-Za-z0-9_.\-]*)$",
            )
            .unwrap(),
        }
    }

    /// Parse module source text; `path` is recorded as the module source
    pub fn parse_str(&self, source: &str, path: &Path) -> Result<Module> {
        let fail = |message: String| SchedError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let tokens = tokenize(source).map_err(&fail)?;
        let mut pos = 0;
        let statements = parse_block(&tokens, &mut pos, false).map_err(&fail)?;

        let root = match statements.as_slice() {
            [stmt] if stmt.keyword == "module" => stmt,
            [stmt] if stmt.keyword == "submodule" => {
                return Err(fail("submodules cannot be installed on their own".to_string()));
            }
            [] => return Err(fail("no module statement found".to_string())),
            _ => return Err(fail("expected exactly one top-level module statement".to_string())),
        };

        self.build_module(root, path).map_err(fail)
    }

    fn build_module(&self, root: &Statement, path: &Path) -> std::result::Result<Module, String> {
        let name = self.identifier_arg(root)?;
        let own_prefix = root
            .child("prefix")
            .ok_or_else(|| format!("module {} has no prefix statement", name))?
            .arg
            .clone()
            .unwrap_or_default();

        let mut prefixes: HashMap<String, String> = HashMap::new();
        prefixes.insert(own_prefix, name.clone());

        let mut module = Module::new(&name, PathBuf::from(path));

        for stmt in root.children_named("revision") {
            let raw = stmt.arg.as_deref().unwrap_or_default();
            let revision = Revision::parse(raw)
                .map_err(|e| format!("line {}: invalid revision '{}': {}", stmt.line, raw, e))?;
            if module.revision.map(|r| revision > r).unwrap_or(true) {
                module.revision = Some(revision);
            }
        }

        for stmt in root.children_named("import") {
            let imported = self.identifier_arg(stmt)?;
            let prefix = stmt
                .child("prefix")
                .and_then(|p| p.arg.clone())
                .ok_or_else(|| format!("line {}: import {} has no prefix", stmt.line, imported))?;
            let revision = match stmt.child("revision-date").and_then(|r| r.arg.as_deref()) {
                Some(raw) => Some(Revision::parse(raw).map_err(|e| {
                    format!("line {}: invalid revision-date '{}': {}", stmt.line, raw, e)
                })?),
                None => None,
            };
            prefixes.insert(prefix, imported.clone());
            module.imports.push(Import {
                module: imported,
                revision,
            });
        }

        for stmt in root.children_named("feature") {
            let feature_name = self.identifier_arg(stmt)?;
            if module.feature(&feature_name).is_some() {
                return Err(format!("line {}: duplicate feature {}", stmt.line, feature_name));
            }
            let mut feature = Feature::new(&feature_name);
            for cond in stmt.children_named("if-feature") {
                let expr = cond.arg.as_deref().unwrap_or_default();
                for prerequisite in self.parse_if_feature(expr, &name, &prefixes, cond.line)? {
                    if !feature.prerequisites.contains(&prerequisite) {
                        feature.prerequisites.push(prerequisite);
                    }
                }
            }
            module.features.push(feature);
        }

        Ok(module)
    }

    /// Split an `if-feature` conjunction into qualified feature references
    fn parse_if_feature(
        &self,
        expr: &str,
        module: &str,
        prefixes: &HashMap<String, String>,
        line: usize,
    ) -> std::result::Result<Vec<FeatureRef>, String> {
        let words: Vec<&str> = expr.split_whitespace().collect();
        if words.is_empty() {
            return Err(format!("line {}: empty if-feature expression", line));
        }

        let mut refs = Vec::new();
        for (i, word) in words.iter().enumerate() {
            if i % 2 == 1 {
                if *word != "and" {
                    return Err(format!(
                        "line {}: unsupported if-feature operator '{}' in \"{}\"",
                        line, word, expr
                    ));
                }
                continue;
            }
            let caps = self
                .feature_ref
                .captures(word)
                .filter(|_| *word != "and" && *word != "or" && *word != "not")
                .ok_or_else(|| {
                    format!(
                        "line {}: unsupported if-feature term '{}' in \"{}\"",
                        line, word, expr
                    )
                })?;
            let target_module = match caps.get(1) {
                Some(prefix) => prefixes
                    .get(prefix.as_str())
                    .cloned()
                    .ok_or_else(|| format!("line {}: unknown prefix '{}'", line, prefix.as_str()))?,
                None => module.to_string(),
            };
            refs.push(FeatureRef::new(target_module, &caps[2]));
        }
        if words.len() % 2 == 0 {
            return Err(format!("line {}: dangling operator in \"{}\"", line, expr));
        }
        Ok(refs)
    }

    fn identifier_arg(&self, stmt: &Statement) -> std::result::Result<String, String> {
        let arg = stmt
            .arg
            .as_deref()
            .ok_or_else(|| {
                format!("line {}: {} statement needs an argument", stmt.line, stmt.keyword)
            })?;
        if !self.identifier.is_match(arg) {
            return Err(format!("line {}: invalid identifier '{}'", stmt.line, arg));
        }
        Ok(arg.to_string())
    }
}

/// Find the schema file of `module` in the search directories
///
/// Accepts `name.yang` and `name@revision.yang`; a requested revision only
/// matches its own revisioned file or the unrevisioned one.
pub fn locate_module(
    search_dirs: &[PathBuf],
    module: &str,
    revision: Option<Revision>,
) -> Option<PathBuf> {
    let exact = format!("{}.yang", module);
    let wanted = revision.map(|r| format!("{}.yang", r.file_stem(module)));
    let revisioned_prefix = format!("{}@", module);

    search_dirs
        .iter()
        .filter(|dir| dir.is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
        })
        .filter(|e| e.file_type().is_file())
        .find(|e| {
            let name = e.file_name().to_string_lossy();
            if name == exact {
                return true;
            }
            match &wanted {
                Some(wanted) => name == wanted.as_str(),
                None => name.starts_with(&revisioned_prefix) && name.ends_with(".yang"),
            }
        })
        .map(|e| e.into_path())
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Quoted(String),
    Plus,
    Open,
    Close,
    Semi,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
}

#[derive(Debug)]
struct Statement {
    keyword: String,
    arg: Option<String>,
    children: Vec<Statement>,
    line: usize,
}

impl Statement {
    fn child(&self, keyword: &str) -> Option<&Statement> {
        self.children.iter().find(|c| c.keyword == keyword)
    }

    fn children_named<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a Statement> + 'a {
        self.children.iter().filter(move |c| c.keyword == keyword)
    }
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("line {}: unterminated comment", start)),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '{' | '}' | ';' | '+' => {
                let kind = match c {
                    '{' => TokenKind::Open,
                    '}' => TokenKind::Close,
                    ';' => TokenKind::Semi,
                    _ => TokenKind::Plus,
                };
                tokens.push(Token { kind, line });
                i += 1;
            }
            '"' | '\'' => {
                let start = line;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("line {}: unterminated string", start)),
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some('\\') if c == '"' => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(&other) => other,
                                None => return Err(format!("line {}: unterminated string", start)),
                            };
                            text.push(escaped);
                            i += 2;
                        }
                        Some(&ch) => {
                            if ch == '\n' {
                                line += 1;
                            }
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Quoted(text),
                    line: start,
                });
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_whitespace() || matches!(ch, '{' | '}' | ';' | '"' | '\'') {
                        break;
                    }
                    word.push(ch);
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Word(word),
                    line,
                });
            }
        }
    }

    Ok(tokens)
}

fn parse_block(
    tokens: &[Token],
    pos: &mut usize,
    nested: bool,
) -> std::result::Result<Vec<Statement>, String> {
    let mut statements = Vec::new();
    loop {
        let Some(token) = tokens.get(*pos) else {
            if nested {
                return Err("unexpected end of input, missing '}'".to_string());
            }
            return Ok(statements);
        };
        match &token.kind {
            TokenKind::Close if nested => {
                *pos += 1;
                return Ok(statements);
            }
            TokenKind::Word(keyword) => {
                let line = token.line;
                let keyword = keyword.clone();
                *pos += 1;
                let arg = parse_argument(tokens, pos)?;
                let children = match tokens.get(*pos).map(|t| &t.kind) {
                    Some(TokenKind::Semi) => {
                        *pos += 1;
                        Vec::new()
                    }
                    Some(TokenKind::Open) => {
                        *pos += 1;
                        parse_block(tokens, pos, true)?
                    }
                    _ => {
                        return Err(format!(
                            "line {}: expected ';' or '{{' after {}",
                            line, keyword
                        ))
                    }
                };
                statements.push(Statement {
                    keyword,
                    arg,
                    children,
                    line,
                });
            }
            other => return Err(format!("line {}: unexpected token {:?}", token.line, other)),
        }
    }
}

/// Statement argument: a bare word, or quoted strings joined with `+`
fn parse_argument(
    tokens: &[Token],
    pos: &mut usize,
) -> std::result::Result<Option<String>, String> {
    match tokens.get(*pos).map(|t| &t.kind) {
        Some(TokenKind::Word(word)) => {
            *pos += 1;
            Ok(Some(word.clone()))
        }
        Some(TokenKind::Quoted(text)) => {
            let mut arg = text.clone();
            *pos += 1;
            while let Some(TokenKind::Plus) = tokens.get(*pos).map(|t| &t.kind) {
                match tokens.get(*pos + 1) {
                    Some(Token {
                        kind: TokenKind::Quoted(more),
                        ..
                    }) => {
                        arg.push_str(more);
                        *pos += 2;
                    }
                    Some(t) => return Err(format!("line {}: expected string after '+'", t.line)),
                    None => return Err("unexpected end of input after '+'".to_string()),
                }
            }
            Ok(Some(arg))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPS2: &str = r#"
        module feature-deps2 {
            yang-version 1.1;
            namespace "urn:feature-deps2";
            prefix fd2;

            revision 2019-01-01;

            feature featx {
                description "Independent feature.";
            }

            container cont {
                if-feature featx;
                leaf l { type string; }
            }
        }
    "#;

    const DEPS: &str = r#"
        module feature-deps {
            namespace "urn:feature-deps";
            prefix fd;

            import feature-deps2 {
                prefix fd2;
            }

            /* dependent features */
            feature feat1 { if-feature "fd2:featx"; }
            feature feat2 { if-feature 'fd2:featx'; }
            feature feat3 {
                if-feature "fd2:" + "featx";  // concatenated
            }
            feature feat4 { if-feature "feat1 and fd2:featx"; }
        }
    "#;

    fn parse(source: &str) -> Result<Module> {
        YangParser::new().parse_str(source, Path::new("test.yang"))
    }

    #[test]
    fn test_parse_independent_module() {
        let module = parse(DEPS2).unwrap();
        assert_eq!(module.name, "feature-deps2");
        assert_eq!(module.revision.unwrap().to_string(), "2019-01-01");
        assert_eq!(module.features.len(), 1);
        assert!(module.features[0].prerequisites.is_empty());
        assert!(!module.features[0].enabled);
    }

    #[test]
    fn test_parse_resolves_prefixes() {
        let module = parse(DEPS).unwrap();
        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.imports[0].module, "feature-deps2");

        let featx = FeatureRef::new("feature-deps2", "featx");
        for name in ["feat1", "feat2", "feat3"] {
            assert_eq!(module.feature(name).unwrap().prerequisites, vec![featx.clone()]);
        }
        assert_eq!(
            module.feature("feat4").unwrap().prerequisites,
            vec![FeatureRef::new("feature-deps", "feat1"), featx]
        );
    }

    #[test]
    fn test_latest_revision_wins() {
        let source = "module m { prefix m; revision 2018-01-01; revision 2020-05-05; \
                      revision 2019-01-01; }";
        let module = parse(source).unwrap();
        assert_eq!(module.revision.unwrap().to_string(), "2020-05-05");
    }

    #[test]
    fn test_rejects_unsupported_if_feature() {
        let err = parse(
            "module m { prefix m; feature a; feature b; feature c { if-feature \"a or b\"; } }",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported if-feature operator 'or'"));

        let source = "module m { prefix m; feature a; feature c { if-feature \"not a\"; } }";
        let err = parse(source).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_rejects_unknown_prefix() {
        let err = parse("module m { prefix m; feature c { if-feature \"x:a\"; } }").unwrap_err();
        assert!(err.to_string().contains("unknown prefix 'x'"));
    }

    #[test]
    fn test_rejects_submodule_and_garbage() {
        assert!(parse("submodule s { belongs-to m { prefix m; } }").is_err());
        assert!(parse("module m { prefix m;").is_err());
        assert!(parse("").is_err());
        assert!(parse("module m { prefix m; feature f; feature f; }").is_err());
    }

    #[test]
    fn test_locate_module() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("feature-deps2.yang"), DEPS2).unwrap();
        fs::write(second.path().join("other@2019-01-01.yang"), "").unwrap();
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        assert_eq!(
            locate_module(&dirs, "feature-deps2", None),
            Some(second.path().join("feature-deps2.yang"))
        );
        assert!(locate_module(&dirs, "other", None).is_some());
        let rev = |raw: &str| Some(Revision::parse(raw).unwrap());
        assert!(locate_module(&dirs, "other", rev("2019-01-01")).is_some());
        assert!(locate_module(&dirs, "other", rev("2020-01-01")).is_none());
        assert!(locate_module(&dirs, "feature-deps", None).is_none());
        assert!(locate_module(&[], "feature-deps2", None).is_none());
    }

    #[test]
    fn test_parse_module_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature-deps2.yang");
        fs::write(&path, DEPS2).unwrap();

        let module = YangParser::new().parse_module(&path).unwrap();
        assert_eq!(module.source, path);
    }
}
