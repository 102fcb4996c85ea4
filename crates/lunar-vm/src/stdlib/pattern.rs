//! Lua pattern matching over bytes.

/// Deepest recursion a single match may use.
const MAX_DEPTH: usize = 200;
pub(crate) const MAX_CAPTURES: usize = 32;

/// One capture of a successful match.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Capture {
    /// Byte range into the subject.
    Span(usize, usize),
    /// `()` position capture, 1-based.
    Position(usize),
}

#[derive(Clone, Copy)]
enum Len {
    Closed(usize),
    Unclosed,
    Position,
}

pub(crate) struct Matcher<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    depth: usize,
    level: usize,
    capture: [(usize, Len); MAX_CAPTURES],
}

impl<'a> Matcher<'a> {
    pub(crate) fn new(src: &'a [u8], pat: &'a [u8]) -> Self {
        Self {
            src,
            pat,
            depth: 0,
            level: 0,
            capture: [(0, Len::Unclosed); MAX_CAPTURES],
        }
    }

    /// Try to match at `start` with pattern offset `p`; returns the end.
    pub(crate) fn try_at(&mut self, start: usize, p: usize) -> Result<Option<usize>, String> {
        self.level = 0;
        self.depth = 0;
        self.do_match(start, p)
    }

    /// Captures of the last match; the whole match when there are none.
    pub(crate) fn captures(&self, start: usize, end: usize, whole: bool) -> Result<Vec<Capture>, String> {
        if self.level == 0 && whole {
            return Ok(vec![Capture::Span(start, end)]);
        }
        (0..self.level)
            .map(|i| match self.capture[i] {
                (s, Len::Closed(n)) => Ok(Capture::Span(s, s + n)),
                (s, Len::Position) => Ok(Capture::Position(s + 1)),
                (_, Len::Unclosed) => Err("unfinished capture".to_string()),
            })
            .collect()
    }

    pub(crate) fn capture_count(&self) -> usize {
        self.level
    }

    fn do_match(&mut self, mut s: usize, mut p: usize) -> Result<Option<usize>, String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("pattern too complex".to_string());
        }
        let result = loop {
            if p == self.pat.len() {
                break Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    break if self.pat.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, Len::Position)
                    } else {
                        self.start_capture(s, p + 1, Len::Unclosed)
                    };
                }
                b')' => break self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    break Ok((s == self.src.len()).then_some(s));
                }
                b'%' if self.pat.get(p + 1) == Some(&b'b') => {
                    match self.match_balance(s, p + 2)? {
                        Some(end) => {
                            s = end;
                            p += 4;
                            continue;
                        }
                        None => break Ok(None),
                    }
                }
                b'%' if self.pat.get(p + 1) == Some(&b'f') => {
                    p += 2;
                    if self.pat.get(p) != Some(&b'[') {
                        break Err("missing '[' after '%f' in pattern".to_string());
                    }
                    let ep = self.class_end(p)?;
                    let prev = if s == 0 { 0 } else { self.src[s - 1] };
                    let cur = self.src.get(s).copied().unwrap_or(0);
                    if !self.match_set(prev, p, ep - 1) && self.match_set(cur, p, ep - 1) {
                        p = ep;
                        continue;
                    }
                    break Ok(None);
                }
                b'%' if self.pat.get(p + 1).is_some_and(u8::is_ascii_digit) => {
                    match self.match_backref(s, self.pat[p + 1])? {
                        Some(end) => {
                            s = end;
                            p += 2;
                            continue;
                        }
                        None => break Ok(None),
                    }
                }
                _ => {}
            }

            let ep = self.class_end(p)?;
            let single = s < self.src.len() && self.single_match(self.src[s], p, ep);
            match self.pat.get(ep) {
                Some(b'?') => {
                    if single {
                        if let Some(end) = self.do_match(s + 1, ep + 1)? {
                            break Ok(Some(end));
                        }
                    }
                    p = ep + 1;
                }
                Some(b'+') => break if single { self.max_expand(s + 1, p, ep) } else { Ok(None) },
                Some(b'*') => break self.max_expand(s, p, ep),
                Some(b'-') => break self.min_expand(s, p, ep),
                _ => {
                    if !single {
                        break Ok(None);
                    }
                    s += 1;
                    p = ep;
                }
            }
        };
        self.depth -= 1;
        result
    }

    fn start_capture(&mut self, s: usize, p: usize, len: Len) -> Result<Option<usize>, String> {
        if self.level >= MAX_CAPTURES {
            return Err("too many captures".to_string());
        }
        self.capture[self.level] = (s, len);
        self.level += 1;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.level -= 1;
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> Result<Option<usize>, String> {
        let open = (0..self.level)
            .rev()
            .find(|&i| matches!(self.capture[i].1, Len::Unclosed))
            .ok_or_else(|| "invalid pattern capture".to_string())?;
        self.capture[open].1 = Len::Closed(s - self.capture[open].0);
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.capture[open].1 = Len::Unclosed;
        }
        Ok(result)
    }

    fn match_balance(&self, s: usize, p: usize) -> Result<Option<usize>, String> {
        let (Some(&open), Some(&close)) = (self.pat.get(p), self.pat.get(p + 1)) else {
            return Err("missing arguments to '%b'".to_string());
        };
        if self.src.get(s) != Some(&open) {
            return Ok(None);
        }
        let mut depth = 1;
        for (i, &c) in self.src.iter().enumerate().skip(s + 1) {
            if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            } else if c == open {
                depth += 1;
            }
        }
        Ok(None)
    }

    fn match_backref(&self, s: usize, digit: u8) -> Result<Option<usize>, String> {
        let n = (digit - b'0') as usize;
        let (start, len) = match n.checked_sub(1).map(|i| (i, self.capture.get(i))) {
            Some((i, Some(&(start, Len::Closed(len))))) if i < self.level => (start, len),
            _ => return Err(format!("invalid capture index %{n}")),
        };
        let captured = &self.src[start..start + len];
        Ok(self.src[s..].starts_with(captured).then_some(s + len))
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> Result<Option<usize>, String> {
        let mut n = 0;
        while s + n < self.src.len() && self.single_match(self.src[s + n], p, ep) {
            n += 1;
        }
        loop {
            if let Some(end) = self.do_match(s + n, ep + 1)? {
                return Ok(Some(end));
            }
            if n == 0 {
                return Ok(None);
            }
            n -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> Result<Option<usize>, String> {
        loop {
            if let Some(end) = self.do_match(s, ep + 1)? {
                return Ok(Some(end));
            }
            if s < self.src.len() && self.single_match(self.src[s], p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    /// Offset just past the single-character class starting at `p`.
    fn class_end(&self, p: usize) -> Result<usize, String> {
        let pat = self.pat;
        match pat[p] {
            b'%' => {
                if p + 1 >= pat.len() {
                    return Err("malformed pattern (ends with '%')".to_string());
                }
                Ok(p + 2)
            }
            b'[' => {
                let mut q = p + 1;
                if pat.get(q) == Some(&b'^') {
                    q += 1;
                }
                // The first character of a set is always a member, even ']'.
                loop {
                    let Some(&c) = pat.get(q) else {
                        return Err("malformed pattern (missing ']')".to_string());
                    };
                    q += 1;
                    if c == b'%' {
                        q += 1;
                    }
                    match pat.get(q) {
                        Some(b']') => return Ok(q + 1),
                        Some(_) => {}
                        None => return Err("malformed pattern (missing ']')".to_string()),
                    }
                }
            }
            _ => Ok(p + 1),
        }
    }

    fn single_match(&self, c: u8, p: usize, ep: usize) -> bool {
        match self.pat[p] {
            b'.' => true,
            b'%' => class_matches(c, self.pat[p + 1]),
            b'[' => self.match_set(c, p, ep - 1),
            lit => lit == c,
        }
    }

    /// `p` is the '[' and `end` the closing ']'.
    fn match_set(&self, c: u8, p: usize, end: usize) -> bool {
        let mut q = p + 1;
        let negate = self.pat.get(q) == Some(&b'^');
        if negate {
            q += 1;
        }
        while q < end {
            let pc = self.pat[q];
            if pc == b'%' && q + 1 < end {
                if class_matches(c, self.pat[q + 1]) {
                    return !negate;
                }
                q += 2;
            } else if self.pat.get(q + 1) == Some(&b'-') && q + 2 < end {
                if pc <= c && c <= self.pat[q + 2] {
                    return !negate;
                }
                q += 3;
            } else {
                if pc == c {
                    return !negate;
                }
                q += 1;
            }
        }
        negate
    }
}

fn class_matches(c: u8, class: u8) -> bool {
    let matched = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => c.is_ascii_whitespace() || c == 0x0b,
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return class == c,
    };
    if class.is_ascii_uppercase() {
        !matched
    } else {
        matched
    }
}

/// True when `pat` has no magic characters and can be searched literally.
pub(crate) fn is_plain(pat: &[u8]) -> bool {
    !pat.iter().any(|c| b"^$*+?.([%-".contains(c))
}

/// First match of `pat` in `src` at or after `init`: `(start, end, matcher)`.
pub(crate) fn find<'a>(
    src: &'a [u8],
    pat: &'a [u8],
    init: usize,
) -> Result<Option<(usize, usize, Matcher<'a>)>, String> {
    let anchored = pat.first() == Some(&b'^');
    let p = usize::from(anchored);
    let mut m = Matcher::new(src, pat);
    let mut s = init;
    loop {
        if let Some(end) = m.try_at(s, p)? {
            return Ok(Some((s, end, m)));
        }
        s += 1;
        if anchored || s > src.len() {
            return Ok(None);
        }
    }
}
