//! GDB Machine Interface (MI) Line Parser
//!
//! Pure function from one output line to a structured record. Malformed
//! input never aborts the stream: the parser returns `None` and the caller
//! keeps reading.

use crate::mi::types::{MiRecord, MiValue, ResultClass, StreamKind};

/// Parse a single line of GDB/MI output.
///
/// Returns `None` for blank lines, the `(gdb)` prompt, and anything that
/// does not match the MI grammar.
pub fn parse_line(line: &str) -> Option<MiRecord> {
    let line = line.trim_end_matches(['\r', '\n']).trim();
    if line.is_empty() || line == "(gdb)" {
        return None;
    }

    // Optional numeric sequence token before '^' or '*'.
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let (token, rest) = if digits > 0 {
        match line[..digits].parse::<u64>() {
            Ok(t) => (Some(t), &line[digits..]),
            Err(_) => (None, line),
        }
    } else {
        (None, line)
    };

    let mut chars = rest.chars();
    let prefix = chars.next()?;
    let body = chars.as_str();

    match prefix {
        '^' => {
            let (class, results) = parse_class_and_results(body)?;
            let class = ResultClass::from_str(&class)?;
            Some(MiRecord::Result {
                token,
                class,
                results,
            })
        }
        '*' => {
            let (class, results) = parse_class_and_results(body)?;
            Some(MiRecord::ExecAsync {
                token,
                class,
                results,
            })
        }
        '=' if token.is_none() => {
            let (class, results) = parse_class_and_results(body)?;
            Some(MiRecord::Notify { class, results })
        }
        '~' | '@' | '&' if token.is_none() => {
            let kind = match prefix {
                '~' => StreamKind::Console,
                '@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            let mut cur = Cursor::new(body);
            let text = cur.parse_cstring()?;
            Some(MiRecord::Stream { kind, text })
        }
        _ => None,
    }
}

/// `<class>` or `<class>,<results>` after the prefix character.
fn parse_class_and_results(body: &str) -> Option<(String, Vec<(String, MiValue)>)> {
    let (class, rest) = match body.find(',') {
        Some(pos) => (&body[..pos], &body[pos + 1..]),
        None => (body, ""),
    };
    if class.is_empty()
        || !class
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    let results = if rest.is_empty() {
        Vec::new()
    } else {
        parse_results(rest)?
    };
    Some((class.to_string(), results))
}

/// Parse a full comma-separated `key=value` sequence; must consume everything.
fn parse_results(input: &str) -> Option<Vec<(String, MiValue)>> {
    let mut cur = Cursor::new(input);
    let mut out = Vec::new();
    loop {
        out.push(cur.parse_result()?);
        if cur.rest.is_empty() {
            return Some(out);
        }
        cur.expect(',')?;
    }
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn expect(&mut self, c: char) -> Option<()> {
        if self.peek() == Some(c) {
            self.rest = &self.rest[c.len_utf8()..];
            Some(())
        } else {
            None
        }
    }

    /// `key=value`
    fn parse_result(&mut self) -> Option<(String, MiValue)> {
        let eq = self.rest.find('=')?;
        let key = &self.rest[..eq];
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return None;
        }
        let key = key.to_string();
        self.rest = &self.rest[eq + 1..];
        let value = self.parse_value()?;
        Some((key, value))
    }

    fn parse_value(&mut self) -> Option<MiValue> {
        match self.peek()? {
            '"' => self.parse_cstring().map(MiValue::String),
            '{' => self.parse_tuple(),
            '[' => self.parse_list(),
            _ => None,
        }
    }

    /// `"..."` with C-style escapes. GDB emits `\n \t \r \" \\` and octal
    /// escapes for non-ASCII bytes; unknown escapes pass through verbatim.
    fn parse_cstring(&mut self) -> Option<String> {
        self.expect('"')?;
        let mut out = String::new();
        let mut chars = self.rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = &self.rest[i + 1..];
                    return Some(out);
                }
                '\\' => {
                    let (_, esc) = chars.next()?;
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '0'..='7' => {
                            // Up to three octal digits; keep the raw byte value.
                            let mut val = esc as u32 - '0' as u32;
                            let mut taken = 1;
                            while taken < 3 {
                                match chars.clone().next() {
                                    Some((_, d @ '0'..='7')) => {
                                        val = val * 8 + (d as u32 - '0' as u32);
                                        chars.next();
                                        taken += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push(char::from_u32(val).unwrap_or('\u{fffd}'));
                        }
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                _ => out.push(c),
            }
        }
        None
    }

    /// `{}` tuple of `key=value` pairs, insertion order preserved.
    fn parse_tuple(&mut self) -> Option<MiValue> {
        self.expect('{')?;
        let mut entries = Vec::new();
        if self.peek() == Some('}') {
            self.expect('}')?;
            return Some(MiValue::Tuple(entries));
        }
        loop {
            entries.push(self.parse_result()?);
            match self.peek()? {
                ',' => {
                    self.expect(',')?;
                }
                '}' => {
                    self.expect('}')?;
                    return Some(MiValue::Tuple(entries));
                }
                _ => return None,
            }
        }
    }

    /// `[]` list. Elements are either plain values or `key=value` results
    /// (GDB emits both, e.g. `body=[bkpt={...},bkpt={...}]`); results are
    /// represented as single-entry tuples.
    fn parse_list(&mut self) -> Option<MiValue> {
        self.expect('[')?;
        let mut items = Vec::new();
        if self.peek() == Some(']') {
            self.expect(']')?;
            return Some(MiValue::List(items));
        }
        loop {
            let item = match self.peek()? {
                '"' | '{' | '[' => self.parse_value()?,
                _ => {
                    let (key, value) = self.parse_result()?;
                    MiValue::Tuple(vec![(key, value)])
                }
            };
            items.push(item);
            match self.peek()? {
                ',' => {
                    self.expect(',')?;
                }
                ']' => {
                    self.expect(']')?;
                    return Some(MiValue::List(items));
                }
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::types::find;

    #[test]
    fn parse_result_done() {
        let rec = parse_line("^done").unwrap();
        match rec {
            MiRecord::Result { token, class, results } => {
                assert_eq!(token, None);
                assert_eq!(class, ResultClass::Done);
                assert!(results.is_empty());
            }
            _ => panic!("expected result record"),
        }
    }

    #[test]
    fn parse_result_with_token_and_payload() {
        let rec = parse_line("42^done,bkpt={number=\"1\",type=\"breakpoint\"}").unwrap();
        match rec {
            MiRecord::Result { token, class, results } => {
                assert_eq!(token, Some(42));
                assert_eq!(class, ResultClass::Done);
                let bkpt = find(&results, "bkpt").unwrap();
                assert_eq!(bkpt.get("number").unwrap().as_str(), Some("1"));
            }
            _ => panic!("expected result record"),
        }
    }

    #[test]
    fn parse_exec_async_stopped() {
        let rec = parse_line("*stopped,reason=\"breakpoint-hit\",thread-id=\"1\"").unwrap();
        match rec {
            MiRecord::ExecAsync { class, results, .. } => {
                assert_eq!(class, "stopped");
                assert_eq!(
                    find(&results, "reason").unwrap().as_str(),
                    Some("breakpoint-hit")
                );
            }
            _ => panic!("expected exec-async record"),
        }
    }

    #[test]
    fn parse_notify() {
        let rec = parse_line("=breakpoint-modified,bkpt={number=\"2\"}").unwrap();
        match rec {
            MiRecord::Notify { class, .. } => assert_eq!(class, "breakpoint-modified"),
            _ => panic!("expected notify record"),
        }
    }

    #[test]
    fn parse_stream_records() {
        let rec = parse_line("~\"Hello\\n\"").unwrap();
        assert_eq!(
            rec,
            MiRecord::Stream {
                kind: StreamKind::Console,
                text: "Hello\n".to_string()
            }
        );
        let rec = parse_line("&\"warning: no symbols\\n\"").unwrap();
        matches!(rec, MiRecord::Stream { kind: StreamKind::Log, .. });
    }

    #[test]
    fn parse_nested_list_of_results() {
        let rec =
            parse_line("^done,body=[bkpt={number=\"1\"},bkpt={number=\"2\"}]").unwrap();
        let MiRecord::Result { results, .. } = rec else {
            panic!("expected result record");
        };
        let body = find(&results, "body").unwrap().as_list().unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(
            body[1].get("bkpt").unwrap().get("number").unwrap().as_str(),
            Some("2")
        );
    }

    #[test]
    fn prompt_and_blank_produce_nothing() {
        assert_eq!(parse_line("(gdb)"), None);
        assert_eq!(parse_line("(gdb) "), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn malformed_input_never_panics() {
        for line in [
            "^done,",
            "^done,foo",
            "^done,foo=",
            "^done,foo={bar",
            "^bogus-class",
            "*",
            "~\"unterminated",
            "=,x=\"1\"",
            "12345",
            "garbage output from target",
            "^done,a=\"\\",
        ] {
            assert_eq!(parse_line(line), None, "line {:?}", line);
        }
    }

    #[test]
    fn octal_escapes_decode() {
        let rec = parse_line("~\"caf\\303\\251\"").unwrap();
        let MiRecord::Stream { text, .. } = rec else {
            panic!()
        };
        // Octal escapes carry raw bytes; each becomes one scalar here.
        assert_eq!(text.chars().count(), 5);
    }

    #[test]
    fn parsing_is_deterministic() {
        let line = "7^done,value=\"0x1000\",list=[\"a\",{x=\"1\"}]";
        assert_eq!(parse_line(line), parse_line(line));
    }

    #[test]
    fn hex_values_parse_as_u64() {
        let rec = parse_line("^done,addr=\"0x08000100\"").unwrap();
        let MiRecord::Result { results, .. } = rec else {
            panic!()
        };
        assert_eq!(find(&results, "addr").unwrap().as_u64(), Some(0x0800_0100));
    }
}
