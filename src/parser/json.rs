use super::{line_at, ContentType, ExtractionStrategy, RawChunk};
use anyhow::{bail, Context, Result};
use std::path::Path;

const MAX_DEPTH: usize = 4;
const MAX_CHUNKS: usize = 200;

/// Recursive key-path walk over the raw JSON text, so every chunk keeps its
/// verbatim text and real line span. Object members inside arrays are not chunked.
pub struct JsonStrategy;

impl ExtractionStrategy for JsonStrategy {
    fn tag(&self) -> &'static str {
        "json"
    }

    fn extract(&self, _file_path: &Path, content: &str) -> Result<Vec<RawChunk>> {
        serde_json::from_str::<serde_json::Value>(content).context("Invalid JSON")?;

        let mut scanner = Scanner {
            text: content,
            pos: 0,
            out: Vec::new(),
        };
        scanner.skip_ws();
        if scanner.peek() == Some(b'{') {
            scanner.object("", 1)?;
        }
        Ok(scanner.out)
    }
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    out: Vec<RawChunk>,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() != Some(byte) {
            bail!("Expected '{}' at byte {}", byte as char, self.pos);
        }
        self.pos += 1;
        Ok(())
    }

    /// Consume a string literal, returning its decoded value
    fn string(&mut self) -> Result<String> {
        let start = self.pos;
        self.expect(b'"')?;
        loop {
            match self.peek() {
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
                None => bail!("Unterminated string"),
            }
        }
        Ok(serde_json::from_str(&self.text[start..self.pos])?)
    }

    fn skip_value(&mut self) -> Result<()> {
        match self.peek() {
            Some(b'"') => {
                self.string()?;
            }
            Some(open @ (b'{' | b'[')) => {
                let close = if open == b'{' { b'}' } else { b']' };
                self.pos += 1;
                loop {
                    self.skip_ws();
                    match self.peek() {
                        Some(b) if b == close => {
                            self.pos += 1;
                            break;
                        }
                        Some(b',' | b':') => self.pos += 1,
                        Some(_) => self.skip_value()?,
                        None => bail!("Unterminated container"),
                    }
                }
            }
            Some(_) => {
                while !matches!(
                    self.peek(),
                    None | Some(b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r')
                ) {
                    self.pos += 1;
                }
            }
            None => bail!("Unexpected end of input"),
        }
        Ok(())
    }

    fn object(&mut self, prefix: &str, depth: usize) -> Result<()> {
        self.expect(b'{')?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }

            let key_start = self.pos;
            let key = self.string()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();

            let path = if prefix.is_empty() {
                key
            } else {
                format!("{}.{}", prefix, key)
            };

            let slot = if self.out.len() < MAX_CHUNKS {
                self.out.push(RawChunk {
                    content_type: ContentType::JsonProperty,
                    name: path.clone(),
                    start_line: line_at(self.text, key_start),
                    end_line: 0,
                    content: String::new(),
                });
                Some(self.out.len() - 1)
            } else {
                None
            };

            if self.peek() == Some(b'{') && depth < MAX_DEPTH {
                self.object(&path, depth + 1)?;
            } else {
                self.skip_value()?;
            }

            if let Some(slot) = slot {
                let chunk = &mut self.out[slot];
                chunk.end_line = line_at(self.text, self.pos.saturating_sub(1));
                chunk.content = self.text[key_start..self.pos].to_string();
            }
        }
    }
}
