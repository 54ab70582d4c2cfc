//! Block-level model of a Caddyfile
//!
//! The document is an ordered list of top-level blocks. Each block keeps its exact source
//! text, so serializing a parsed document reproduces the input byte for byte. Blocks are
//! delimited by brace depth: a block opens on a top-level line containing `{` and closes
//! on the line where the depth returns to zero. Quoted strings and comments are skipped
//! while counting, which keeps placeholders like `{host}` and `"}"` from closing a block.

use std::fmt;

/// What a top-level block is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// The global options block, `{ ... }` with no address
    Global,
    /// A site block keyed by its addresses
    Site { addresses: Vec<String> },
    /// A reusable snippet, `(name) { ... }`
    Snippet { name: String },
    /// Comments, blank lines and stray top-level lines
    Trivia,
}

/// A top-level block together with its exact source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
}

impl Block {
    fn trivia(text: String) -> Self {
        Block {
            kind: BlockKind::Trivia,
            text,
        }
    }

    /// Site addresses, empty for non-site blocks
    pub fn addresses(&self) -> &[String] {
        match &self.kind {
            BlockKind::Site { addresses } => addresses,
            _ => &[],
        }
    }

    /// Whether this site block answers for `domain`
    pub fn matches_domain(&self, domain: &str) -> bool {
        let wanted = domain.to_ascii_lowercase();
        self.addresses()
            .iter()
            .any(|address| normalize_address(address) == wanted)
    }

    /// Insert directive lines right after the block's opening brace
    fn insert_after_open_brace(&mut self, lines: &str) {
        let first_line = self.text.lines().next().unwrap_or("");
        let Some(open) = opening_brace(strip_comment(first_line)) else {
            return;
        };
        let mut pos = open + 1;
        if self.text[pos..].starts_with("\r\n") {
            pos += 2;
            self.text.insert_str(pos, lines);
        } else if self.text[pos..].starts_with('\n') {
            pos += 1;
            self.text.insert_str(pos, lines);
        } else {
            self.text.insert_str(pos, &format!("\n{}", lines));
        }
    }
}

/// Errors raised while parsing a Caddyfile into blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A `}` at top level with no block open
    UnexpectedClose { line: usize },
    /// The file ended inside a block
    Unterminated { line: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedClose { line } => {
                write!(f, "unexpected '}}' at top level on line {}", line)
            }
            ParseError::Unterminated { line } => {
                write!(f, "block opened on line {} is never closed", line)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// A parsed Caddyfile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaddyDocument {
    blocks: Vec<Block>,
}

impl CaddyDocument {
    /// Parse Caddyfile text into blocks
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut blocks = Vec::new();
        let mut trivia = String::new();
        let mut current: Option<(BlockKind, String, usize)> = None;
        let mut depth: i64 = 0;

        for (index, line) in input.split_inclusive('\n').enumerate() {
            let line_no = index + 1;
            let delta = brace_delta(line);

            if let Some((kind, mut text, opened_at)) = current.take() {
                text.push_str(line);
                depth += delta;
                if depth <= 0 {
                    depth = 0;
                    blocks.push(Block { kind, text });
                } else {
                    current = Some((kind, text, opened_at));
                }
                continue;
            }

            let code = strip_comment(line);
            match opening_brace(code) {
                Some(open) if !code.trim().is_empty() => {
                    if !trivia.is_empty() {
                        blocks.push(Block::trivia(std::mem::take(&mut trivia)));
                    }
                    let kind = classify_header(&code[..open]);
                    depth = delta;
                    if depth <= 0 {
                        depth = 0;
                        blocks.push(Block {
                            kind,
                            text: line.to_string(),
                        });
                    } else {
                        current = Some((kind, line.to_string(), line_no));
                    }
                }
                _ => {
                    if delta < 0 {
                        return Err(ParseError::UnexpectedClose { line: line_no });
                    }
                    trivia.push_str(line);
                }
            }
        }

        if let Some((_, _, opened_at)) = current {
            return Err(ParseError::Unterminated { line: opened_at });
        }
        if !trivia.is_empty() {
            blocks.push(Block::trivia(trivia));
        }

        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Addresses of every site block, in document order
    pub fn site_identifiers(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|b| matches!(b.kind, BlockKind::Site { .. }))
            .map(|b| b.addresses().join(", "))
            .collect()
    }

    /// Every individual site address, in document order
    pub fn site_addresses(&self) -> Vec<String> {
        self.blocks
            .iter()
            .flat_map(|b| b.addresses().iter().cloned())
            .collect()
    }

    pub fn contains_site(&self, domain: &str) -> bool {
        self.find_site(domain).is_some()
    }

    pub fn find_site(&self, domain: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.matches_domain(domain))
    }

    /// Upstream of the first `reverse_proxy` directive in the site's block
    pub fn site_upstream(&self, domain: &str) -> Option<String> {
        let block = self.find_site(domain)?;
        block.text.lines().find_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next() == Some("reverse_proxy") {
                let rest: Vec<&str> = tokens.take_while(|t| *t != "{").collect();
                if rest.is_empty() {
                    None
                } else {
                    Some(rest.join(" "))
                }
            } else {
                None
            }
        })
    }

    pub fn global(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.kind == BlockKind::Global)
    }

    pub fn contains_snippet(&self, name: &str) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(&b.kind, BlockKind::Snippet { name: n } if n == name))
    }

    /// Append a block at the end, separated from the previous one by a blank line
    pub fn append_block(&mut self, text: &str) -> Result<(), ParseError> {
        let parsed = CaddyDocument::parse(text)?;
        let current = self.to_string();
        let separator = if current.is_empty() || current.ends_with("\n\n") {
            ""
        } else if current.ends_with('\n') {
            "\n"
        } else {
            "\n\n"
        };
        if !separator.is_empty() {
            self.push_trivia(separator);
        }
        self.blocks.extend(parsed.blocks);
        Ok(())
    }

    /// Remove the site block answering for `domain`
    ///
    /// A whitespace-only separator directly before the block loses one newline, undoing
    /// the separator added by [`CaddyDocument::append_block`]. Every other block is left
    /// untouched.
    pub fn remove_site(&mut self, domain: &str) -> Option<Block> {
        let index = self.blocks.iter().position(|b| b.matches_domain(domain))?;
        let removed = self.blocks.remove(index);

        if index > 0 {
            let previous = &mut self.blocks[index - 1];
            if previous.kind == BlockKind::Trivia && previous.text.trim().is_empty() {
                previous.text.pop();
                if previous.text.is_empty() {
                    self.blocks.remove(index - 1);
                }
            }
        }

        Some(removed)
    }

    /// Insert directive lines into the global options block, creating it at the top
    pub fn insert_global_directives(&mut self, lines: &str) {
        if let Some(global) = self.blocks.iter_mut().find(|b| b.kind == BlockKind::Global) {
            global.insert_after_open_brace(lines);
            return;
        }
        let text = format!("{{\n{}}}\n", lines);
        let mut prefix = vec![
            Block {
                kind: BlockKind::Global,
                text,
            },
        ];
        if !self.blocks.is_empty() {
            prefix.push(Block::trivia("\n".to_string()));
        }
        prefix.append(&mut self.blocks);
        self.blocks = prefix;
    }

    /// Insert a block right after the global options block, or at the top when there is none
    pub fn insert_after_global(&mut self, text: &str) -> Result<(), ParseError> {
        let parsed = CaddyDocument::parse(text)?;
        let position = self
            .blocks
            .iter()
            .position(|b| b.kind == BlockKind::Global)
            .map(|i| i + 1)
            .unwrap_or(0);

        let mut inserted = Vec::new();
        if position > 0 {
            inserted.push(Block::trivia("\n".to_string()));
        }
        inserted.extend(parsed.blocks);
        let next_is_trivia = self
            .blocks
            .get(position)
            .map(|b| b.kind == BlockKind::Trivia)
            .unwrap_or(true);
        if !next_is_trivia {
            inserted.push(Block::trivia("\n".to_string()));
        }
        self.blocks.splice(position..position, inserted);
        Ok(())
    }

    /// Add a directive line to every site block that does not already contain it
    pub fn add_directive_to_sites(&mut self, directive: &str) -> usize {
        let mut changed = 0;
        for block in self
            .blocks
            .iter_mut()
            .filter(|b| matches!(b.kind, BlockKind::Site { .. }))
        {
            let present = block.text.lines().any(|line| line.trim() == directive);
            if !present {
                block.insert_after_open_brace(&format!("\t{}\n", directive));
                changed += 1;
            }
        }
        changed
    }

    fn push_trivia(&mut self, text: &str) {
        match self.blocks.last_mut() {
            Some(last) if last.kind == BlockKind::Trivia => last.text.push_str(text),
            _ => self.blocks.push(Block::trivia(text.to_string())),
        }
    }
}

impl fmt::Display for CaddyDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            f.write_str(&block.text)?;
        }
        Ok(())
    }
}

/// Lowercased host part of a site address, without scheme or path
fn normalize_address(address: &str) -> String {
    let without_scheme = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    host.to_ascii_lowercase()
}

/// Byte index of the brace that opens a block on a header line
///
/// A header ending in `{` opens at that last brace, so `{$DOMAIN} {` is a site block;
/// otherwise the first brace opens a single-line block.
fn opening_brace(code: &str) -> Option<usize> {
    if code.trim_end().ends_with('{') {
        code.rfind('{')
    } else {
        code.find('{')
    }
}

fn classify_header(header: &str) -> BlockKind {
    let header = header.trim();
    if header.is_empty() {
        BlockKind::Global
    } else if header.starts_with('(') && header.ends_with(')') {
        BlockKind::Snippet {
            name: header[1..header.len() - 1].trim().to_string(),
        }
    } else {
        let addresses = header
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        BlockKind::Site { addresses }
    }
}

/// The part of a line before an unquoted `#` comment
fn strip_comment(line: &str) -> &str {
    let mut in_quote: Option<char> = None;
    let mut previous = ' ';
    for (i, c) in line.char_indices() {
        match in_quote {
            Some(q) if c == q && previous != '\\' => in_quote = None,
            Some(_) => {}
            None if c == '"' || c == '`' => in_quote = Some(c),
            None if c == '#' && previous.is_whitespace() => return &line[..i],
            None => {}
        }
        previous = c;
    }
    line
}

/// Net change in brace depth contributed by a line
fn brace_delta(line: &str) -> i64 {
    let mut in_quote: Option<char> = None;
    let mut previous = ' ';
    let mut delta = 0;
    for c in strip_comment(line).chars() {
        match in_quote {
            Some(q) if c == q && previous != '\\' => in_quote = None,
            Some(_) => {}
            None if c == '"' || c == '`' => in_quote = Some(c),
            None if c == '{' => delta += 1,
            None if c == '}' => delta -= 1,
            None => {}
        }
        previous = c;
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# managed by caddy-warden\n{\n\temail admin@example.com\n}\n\n(common) {\n\tencode gzip\n}\n\nexample.com, www.example.com {\n\treverse_proxy localhost:8080\n\theader {\n\t\tX-Served-By \"{host}\"\n\t}\n}\n\napi.example.org {\n\treverse_proxy 127.0.0.1:9000 {\n\t\thealth_uri /health\n\t}\n}\n";

    #[test]
    fn test_parse_classifies_blocks() {
        let doc = CaddyDocument::parse(SAMPLE).unwrap();
        let kinds: Vec<&BlockKind> = doc.blocks().iter().map(|b| &b.kind).collect();
        assert_eq!(kinds[0], &BlockKind::Trivia);
        assert_eq!(kinds[1], &BlockKind::Global);
        assert!(doc.contains_snippet("common"));
        assert_eq!(
            doc.site_identifiers(),
            vec!["example.com, www.example.com", "api.example.org"]
        );
        assert_eq!(
            doc.site_addresses(),
            vec!["example.com", "www.example.com", "api.example.org"]
        );
    }

    #[test]
    fn test_serialize_is_lossless() {
        let doc = CaddyDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.to_string(), SAMPLE);
    }

    #[test]
    fn test_nested_braces_do_not_end_block_early() {
        let doc = CaddyDocument::parse(SAMPLE).unwrap();
        let block = doc.find_site("api.example.org").unwrap();
        assert!(block.text.contains("health_uri /health"));
        assert!(block.text.ends_with("}\n"));
        assert_eq!(doc.site_upstream("api.example.org").as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_quoted_and_commented_braces_are_ignored() {
        let input = "a.example.com {\n\trespond \"}\" 200 # }\n}\nb.example.com {\n\trespond ok\n}\n";
        let doc = CaddyDocument::parse(input).unwrap();
        assert_eq!(doc.site_identifiers(), vec!["a.example.com", "b.example.com"]);
        assert_eq!(doc.to_string(), input);
    }

    #[test]
    fn test_single_line_block() {
        let input = "example.com { respond \"hi\" }\nother.com {\n\trespond ok\n}\n";
        let doc = CaddyDocument::parse(input).unwrap();
        assert_eq!(doc.site_identifiers(), vec!["example.com", "other.com"]);
    }

    #[test]
    fn test_unterminated_block_is_an_error() {
        let err = CaddyDocument::parse("example.com {\n\treverse_proxy :8080\n").unwrap_err();
        assert_eq!(err, ParseError::Unterminated { line: 1 });
    }

    #[test]
    fn test_stray_close_is_an_error() {
        let err = CaddyDocument::parse("}\n").unwrap_err();
        assert_eq!(err, ParseError::UnexpectedClose { line: 1 });
    }

    #[test]
    fn test_find_site_by_any_address_and_scheme() {
        let input = "https://Shop.Example.com:443 {\n\trespond ok\n}\n";
        let doc = CaddyDocument::parse(input).unwrap();
        assert!(doc.contains_site("shop.example.com:443"));
        assert!(!doc.contains_site("example.com"));

        let doc = CaddyDocument::parse(SAMPLE).unwrap();
        assert!(doc.contains_site("www.example.com"));
    }

    #[test]
    fn test_append_then_remove_restores_original() {
        let mut doc = CaddyDocument::parse(SAMPLE).unwrap();
        doc.append_block("new.example.com {\n\treverse_proxy localhost:3000\n}\n")
            .unwrap();
        assert!(doc.contains_site("new.example.com"));
        assert!(doc.to_string().ends_with("}\n\nnew.example.com {\n\treverse_proxy localhost:3000\n}\n"));

        // reparse to mimic the file round trip
        let mut reparsed = CaddyDocument::parse(&doc.to_string()).unwrap();
        let removed = reparsed.remove_site("new.example.com").unwrap();
        assert!(removed.text.contains("localhost:3000"));
        assert_eq!(reparsed.to_string(), SAMPLE);
    }

    #[test]
    fn test_remove_leaves_other_blocks_untouched() {
        let mut doc = CaddyDocument::parse(SAMPLE).unwrap();
        let before: Vec<Block> = doc
            .blocks()
            .iter()
            .filter(|b| b.kind != BlockKind::Trivia && !b.matches_domain("example.com"))
            .cloned()
            .collect();

        doc.remove_site("example.com").unwrap();

        let after: Vec<Block> = doc
            .blocks()
            .iter()
            .filter(|b| b.kind != BlockKind::Trivia)
            .cloned()
            .collect();
        assert_eq!(before, after);
        assert!(!doc.contains_site("www.example.com"));
    }

    #[test]
    fn test_remove_missing_site() {
        let mut doc = CaddyDocument::parse(SAMPLE).unwrap();
        assert!(doc.remove_site("missing.example.com").is_none());
        assert_eq!(doc.to_string(), SAMPLE);
    }

    #[test]
    fn test_insert_global_directives_into_existing_block() {
        let mut doc = CaddyDocument::parse(SAMPLE).unwrap();
        doc.insert_global_directives("\tadmin off\n");
        let global = doc.global().unwrap();
        assert_eq!(global.text, "{\n\tadmin off\n\temail admin@example.com\n}\n");
    }

    #[test]
    fn test_insert_global_directives_creates_block_at_top() {
        let mut doc = CaddyDocument::parse("example.com {\n\trespond ok\n}\n").unwrap();
        doc.insert_global_directives("\tadmin off\n");
        assert_eq!(
            doc.to_string(),
            "{\n\tadmin off\n}\n\nexample.com {\n\trespond ok\n}\n"
        );
        assert_eq!(doc.blocks()[0].kind, BlockKind::Global);
    }

    #[test]
    fn test_insert_after_global_and_import() {
        let mut doc = CaddyDocument::parse(SAMPLE).unwrap();
        doc.insert_after_global("(hardening) {\n\theader -Server\n}\n").unwrap();
        assert!(doc.contains_snippet("hardening"));

        let changed = doc.add_directive_to_sites("import hardening");
        assert_eq!(changed, 2);
        assert_eq!(doc.add_directive_to_sites("import hardening"), 0);

        let reparsed = CaddyDocument::parse(&doc.to_string()).unwrap();
        assert_eq!(reparsed, doc);
        assert!(reparsed
            .find_site("api.example.org")
            .unwrap()
            .text
            .starts_with("api.example.org {\n\timport hardening\n"));
    }
}
