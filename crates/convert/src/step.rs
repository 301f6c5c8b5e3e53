//! Reader for ISO-10303-21 ("STEP physical file") text, the container of
//! IFC exchange files.
//!
//! Only the structure is interpreted here: header entries, and data records
//! of the form `#id=KEYWORD(args);`. Meaning is assigned by `extract`.

use std::collections::BTreeMap;

/// A parsed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    /// `$`
    Null,
    /// `*`
    Derived,
    Integer(i64),
    Real(f64),
    Str(String),
    /// `.NAME.`
    Enum(String),
    /// `#123`
    Ref(u64),
    List(Vec<StepValue>),
    /// `IFCLABEL('x')`
    Typed(String, Vec<StepValue>),
}

impl StepValue {
    pub fn as_ref_id(&self) -> Option<u64> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StepValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub id: u64,
    pub keyword: String,
    pub args: Vec<StepValue>,
    /// 1-based source line where the record starts.
    pub line: usize,
}

impl StepRecord {
    pub fn arg(&self, index: usize) -> Option<&StepValue> {
        self.args.get(index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepFile {
    /// First entry of `FILE_SCHEMA`, e.g. `IFC4`.
    pub schema: String,
    /// First argument of `FILE_NAME`.
    pub file_name: String,
    pub records: BTreeMap<u64, StepRecord>,
}

impl StepFile {
    pub fn get(&self, id: u64) -> Option<&StepRecord> {
        self.records.get(&id)
    }

    pub fn records_of<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.records.values().filter(move |r| r.keyword == keyword)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

/// How often (in records) the parser reports how far it got.
const REPORT_EVERY: usize = 2048;
/// Deepest list or typed-value nesting accepted in one record.
pub const MAX_NESTING: usize = 256;

/// Parse a complete STEP file.
///
/// `checkpoint` receives the fraction of input consumed every few thousand
/// records; returning `false` stops parsing and yields `Ok(None)`.
pub fn parse(
    bytes: &[u8],
    checkpoint: &mut dyn FnMut(f32) -> bool,
) -> Result<Option<StepFile>, ParseError> {
    let mut cur = Cursor::new(bytes);
    let mut file = StepFile::default();

    cur.skip_ws()?;
    let magic = cur.keyword()?;
    if magic != "ISO-10303-21" {
        return Err(cur.error(format!("expected ISO-10303-21, found {magic:?}")));
    }
    cur.expect(b';')?;

    loop {
        cur.skip_ws()?;
        if cur.at_end() {
            return Err(cur.error("missing END-ISO-10303-21".into()));
        }
        let section = cur.keyword()?;
        match section.as_str() {
            "HEADER" => {
                cur.expect(b';')?;
                parse_header(&mut cur, &mut file)?;
            }
            "DATA" => {
                // DATA may carry a parenthesised name in newer editions.
                cur.skip_ws()?;
                if cur.peek() == Some(b'(') {
                    cur.bump();
                    cur.list_tail()?;
                }
                cur.expect(b';')?;
                if !parse_data(&mut cur, &mut file, checkpoint)? {
                    return Ok(None);
                }
            }
            "END-ISO-10303-21" => {
                cur.expect(b';')?;
                break;
            }
            other => return Err(cur.error(format!("unexpected section {other:?}"))),
        }
    }
    Ok(Some(file))
}

fn parse_header(cur: &mut Cursor<'_>, file: &mut StepFile) -> Result<(), ParseError> {
    loop {
        cur.skip_ws()?;
        let keyword = cur.keyword()?;
        if keyword == "ENDSEC" {
            cur.expect(b';')?;
            return Ok(());
        }
        cur.expect(b'(')?;
        let args = cur.list_tail()?;
        cur.expect(b';')?;
        match keyword.as_str() {
            "FILE_NAME" => {
                if let Some(name) = args.first().and_then(StepValue::as_str) {
                    file.file_name = name.to_owned();
                }
            }
            "FILE_SCHEMA" => {
                let schema = args
                    .first()
                    .and_then(StepValue::as_list)
                    .and_then(|l| l.first())
                    .and_then(StepValue::as_str);
                if let Some(schema) = schema {
                    file.schema = schema.to_uppercase();
                }
            }
            _ => {}
        }
    }
}

fn parse_data(
    cur: &mut Cursor<'_>,
    file: &mut StepFile,
    checkpoint: &mut dyn FnMut(f32) -> bool,
) -> Result<bool, ParseError> {
    let mut since_report = 0usize;
    loop {
        cur.skip_ws()?;
        match cur.peek() {
            Some(b'#') => {}
            Some(_) => {
                let keyword = cur.keyword()?;
                if keyword != "ENDSEC" {
                    return Err(cur.error(format!("expected record or ENDSEC, found {keyword:?}")));
                }
                cur.expect(b';')?;
                return Ok(true);
            }
            None => return Err(cur.error("unterminated DATA section".into())),
        }

        let line = cur.line;
        cur.bump();
        let id = cur.unsigned()?;
        cur.expect(b'=')?;
        cur.skip_ws()?;
        let (keyword, args) = if cur.peek() == Some(b'(') {
            // Complex instance: a list of typed partial entities.
            cur.bump();
            (String::new(), cur.list_tail()?)
        } else {
            let keyword = cur.keyword()?;
            cur.expect(b'(')?;
            (keyword, cur.list_tail()?)
        };
        cur.expect(b';')?;

        if file
            .records
            .insert(
                id,
                StepRecord {
                    id,
                    keyword,
                    args,
                    line,
                },
            )
            .is_some()
        {
            return Err(ParseError {
                line,
                message: format!("duplicate record #{id}"),
            });
        }

        since_report += 1;
        if since_report >= REPORT_EVERY {
            since_report = 0;
            if !checkpoint(cur.fraction()) {
                return Ok(false);
            }
        }
    }
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            depth: 0,
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            line: self.line,
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn fraction(&self) -> f32 {
        if self.src.is_empty() {
            1.0
        } else {
            self.pos as f32 / self.src.len() as f32
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_ws(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.src.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.line;
                    self.pos += 2;
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(ParseError {
                                    line: start,
                                    message: "unterminated comment".into(),
                                });
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn expect(&mut self, want: u8) -> Result<(), ParseError> {
        self.skip_ws()?;
        match self.peek() {
            Some(b) if b == want => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(self.error(format!(
                "expected '{}', found '{}'",
                want as char, b as char
            ))),
            None => Err(self.error(format!("expected '{}', found end of input", want as char))),
        }
    }

    fn keyword(&mut self) -> Result<String, ParseError> {
        self.skip_ws()?;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos || !self.src[start].is_ascii_alphabetic() {
            return Err(self.error("expected keyword".into()));
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).to_uppercase())
    }

    fn unsigned(&mut self) -> Result<u64, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("expected record id".into()))
    }

    /// Parse values up to and including the closing `)`. The opening `(` has
    /// already been consumed.
    fn list_tail(&mut self) -> Result<Vec<StepValue>, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("list nesting deeper than {MAX_NESTING}")));
        }
        self.depth += 1;
        let items = self.list_items();
        self.depth -= 1;
        items
    }

    fn list_items(&mut self) -> Result<Vec<StepValue>, ParseError> {
        let mut items = Vec::new();
        self.skip_ws()?;
        if self.peek() == Some(b')') {
            self.bump();
            return Ok(items);
        }
        loop {
            items.push(self.value()?);
            self.skip_ws()?;
            match self.bump() {
                Some(b',') => continue,
                Some(b')') => return Ok(items),
                Some(b) => return Err(self.error(format!("expected ',' or ')', found '{}'", b as char))),
                None => return Err(self.error("unterminated list".into())),
            }
        }
    }

    fn value(&mut self) -> Result<StepValue, ParseError> {
        self.skip_ws()?;
        match self.peek() {
            Some(b'$') => {
                self.bump();
                Ok(StepValue::Null)
            }
            Some(b'*') => {
                self.bump();
                Ok(StepValue::Derived)
            }
            Some(b'#') => {
                self.bump();
                Ok(StepValue::Ref(self.unsigned()?))
            }
            Some(b'\'') => self.string(),
            Some(b'.') => self.enumeration(),
            Some(b'(') => {
                self.bump();
                Ok(StepValue::List(self.list_tail()?))
            }
            Some(b'"') => self.binary(),
            Some(b) if b == b'-' || b == b'+' || b.is_ascii_digit() => self.number(),
            Some(b) if b.is_ascii_alphabetic() => {
                let keyword = self.keyword()?;
                self.expect(b'(')?;
                Ok(StepValue::Typed(keyword, self.list_tail()?))
            }
            Some(b) => Err(self.error(format!("unexpected character '{}'", b as char))),
            None => Err(self.error("unexpected end of input".into())),
        }
    }

    fn string(&mut self) -> Result<StepValue, ParseError> {
        let start_line = self.line;
        self.bump();
        let mut raw = Vec::new();
        loop {
            match self.bump() {
                Some(b'\'') => {
                    if self.peek() == Some(b'\'') {
                        self.bump();
                        raw.push(b'\'');
                    } else {
                        break;
                    }
                }
                Some(b) => raw.push(b),
                None => {
                    return Err(ParseError {
                        line: start_line,
                        message: "unterminated string".into(),
                    });
                }
            }
        }
        Ok(StepValue::Str(decode_control_directives(&raw)))
    }

    fn enumeration(&mut self) -> Result<StepValue, ParseError> {
        self.bump();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).to_uppercase();
        if self.bump() != Some(b'.') || name.is_empty() {
            return Err(self.error("malformed enumeration".into()));
        }
        Ok(StepValue::Enum(name))
    }

    fn binary(&mut self) -> Result<StepValue, ParseError> {
        self.bump();
        let start = self.pos;
        while self.peek().is_some_and(|b| b != b'"') {
            self.bump();
        }
        let raw = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.expect(b'"')?;
        Ok(StepValue::Str(raw))
    }

    fn number(&mut self) -> Result<StepValue, ParseError> {
        let start = self.pos;
        let mut is_real = false;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    is_real = true;
                    self.pos += 1;
                }
                b'E' | b'e' => {
                    is_real = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'-' | b'+')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        if is_real {
            // STEP allows a trailing dot ("1." / "1.E-5"), which Rust accepts.
            text.parse::<f64>()
                .map(StepValue::Real)
                .map_err(|_| self.error(format!("malformed real {text:?}")))
        } else {
            text.parse::<i64>()
                .map(StepValue::Integer)
                .map_err(|_| self.error(format!("malformed integer {text:?}")))
        }
    }
}

/// Decode `\X2\..\X0\`, `\X\hh`, `\S\c` and `\\` escapes inside a string.
fn decode_control_directives(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let rest = &raw[i..];
        if rest.starts_with(b"\\X2\\") {
            let body_start = i + 4;
            if let Some(end) = find(&raw[body_start..], b"\\X0\\") {
                let hex = &raw[body_start..body_start + end];
                let units: Vec<u16> = hex
                    .chunks(4)
                    .filter_map(|c| std::str::from_utf8(c).ok())
                    .filter_map(|c| u16::from_str_radix(c, 16).ok())
                    .collect();
                out.push_str(&String::from_utf16_lossy(&units));
                i = body_start + end + 4;
                continue;
            }
        } else if rest.starts_with(b"\\X\\") && rest.len() >= 5 {
            let hex = std::str::from_utf8(&rest[3..5]).ok();
            if let Some(code) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(char::from(code));
                i += 5;
                continue;
            }
        } else if rest.starts_with(b"\\S\\") && rest.len() >= 4 {
            out.push(char::from(rest[3].wrapping_add(128)));
            i += 4;
            continue;
        } else if rest.starts_with(b"\\\\") {
            out.push('\\');
            i += 2;
            continue;
        }
        // Plain bytes: take the longest run up to the next backslash.
        let run_end = raw[i + 1..]
            .iter()
            .position(|&b| b == b'\\')
            .map_or(raw.len(), |p| i + 1 + p);
        out.push_str(&String::from_utf8_lossy(&raw[i..run_end]));
        i = run_end;
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
