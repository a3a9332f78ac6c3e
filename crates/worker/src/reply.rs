//! FTP reply assembly and the reply-text parsers.
//!
//! The control channel delivers bytes in arbitrary chunks; the assembler
//! regroups them into complete replies, including `nnn-` multi-line blocks.
//! The free functions dig the useful payloads out of reply text: the PASV
//! endpoint, size notes, quoted working directories. Servers take
//! liberties with all of these formats, so the parsers scan permissively
//! rather than match a grammar.

use std::net::Ipv4Addr;

use memchr::{memchr, memrchr};

/// Longest line handed back for a malformed reply; a line that never ends
/// within the cap is returned truncated so one hostile peer cannot grow
/// the buffer without bound.
const MAX_UNPARSED_LINE: usize = 1000;

/// Leading-digit classification of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReplyCategory {
    /// 1xx: the command started; a final reply follows.
    Preliminary,
    /// 2xx: completed successfully.
    Success,
    /// 3xx: accepted; the dialog continues with another command.
    Intermediate,
    /// 4xx: failed, but retrying may succeed.
    Transient,
    /// 5xx: failed permanently.
    Permanent,
}

impl ReplyCategory {
    /// Classification of `code`; `None` when the leading digit is out of
    /// range.
    #[must_use]
    pub fn of(code: u16) -> Option<Self> {
        match code / 100 {
            1 => Some(Self::Preliminary),
            2 => Some(Self::Success),
            3 => Some(Self::Intermediate),
            4 => Some(Self::Transient),
            5 => Some(Self::Permanent),
            _ => None,
        }
    }
}

/// One complete server reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Parsed status code; `None` when the line is not an FTP reply.
    pub code: Option<u16>,
    /// Raw reply text including line terminators.
    pub text: String,
}

impl Reply {
    /// Leading-digit classification, when the reply carries a valid code.
    #[must_use]
    pub fn category(&self) -> Option<ReplyCategory> {
        self.code.and_then(ReplyCategory::of)
    }

    /// Whether this is a connection-class success (`22x`), the shape of a
    /// server greeting.
    #[must_use]
    pub fn is_welcome(&self) -> bool {
        self.code.is_some_and(|c| c / 100 == 2 && (c / 10) % 10 == 2)
    }

    /// Reply lines with terminators trimmed, for the session log.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

/// Outcome of scanning the front of the buffer for one reply.
enum Scan {
    Incomplete,
    Complete { len: usize, code: Option<u16> },
}

/// Accumulates control-channel bytes and hands out complete replies.
#[derive(Default)]
pub struct ReplyAssembler {
    buf: Vec<u8>,
}

impl ReplyAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet forming a complete reply.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drains the next complete reply off the front of the buffer.
    pub fn next_reply(&mut self) -> Option<Reply> {
        match scan(&self.buf) {
            Scan::Incomplete => None,
            Scan::Complete { len, code } => {
                let raw: Vec<u8> = self.buf.drain(..len).collect();
                Some(Reply {
                    code,
                    text: String::from_utf8_lossy(&raw).into_owned(),
                })
            }
        }
    }

    /// Drops buffered bytes, for reuse after a reconnect.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Index just past the LF ending the line that starts at `from`.
fn line_end_after(buf: &[u8], from: usize) -> Option<usize> {
    memchr(b'\n', &buf[from..]).map(|i| from + i + 1)
}

/// Finds one complete reply at the start of `buf`.
///
/// A reply is `nnn text` on one line, or `nnn-` followed by continuation
/// lines until a line opening with the same code and a space. Lines end
/// with LF; a preceding CR belongs to the line. Anything else is handed
/// back as a single code-less line so the caller can reject the peer as
/// not speaking FTP.
fn scan(buf: &[u8]) -> Scan {
    let mut digits = 0usize;
    let mut code: u16 = 0;
    while digits < 3 && digits < buf.len() && buf[digits].is_ascii_digit() {
        code = code * 10 + u16::from(buf[digits] - b'0');
        digits += 1;
    }
    if digits == buf.len() {
        return Scan::Incomplete;
    }
    if digits == 3 {
        if buf[3] == b' ' {
            return match line_end_after(buf, 0) {
                Some(end) => Scan::Complete {
                    len: end,
                    code: Some(code),
                },
                None => Scan::Incomplete,
            };
        }
        if buf[3] == b'-' {
            let mut pos = 0usize;
            loop {
                let Some(next) = line_end_after(buf, pos) else {
                    return Scan::Incomplete;
                };
                pos = next;
                if buf.len() < pos + 4 {
                    return Scan::Incomplete;
                }
                if buf[pos..pos + 3] == buf[..3] && buf[pos + 3] == b' ' {
                    return match line_end_after(buf, pos) {
                        Some(end) => Scan::Complete {
                            len: end,
                            code: Some(code),
                        },
                        None => Scan::Incomplete,
                    };
                }
            }
        }
    }
    // Not an FTP reply. Hand back one raw line, capped.
    let window = &buf[..buf.len().min(MAX_UNPARSED_LINE)];
    match memchr(b'\n', window) {
        Some(i) => Scan::Complete {
            len: i + 1,
            code: None,
        },
        None if buf.len() >= MAX_UNPARSED_LINE => Scan::Complete {
            len: MAX_UNPARSED_LINE,
            code: None,
        },
        None => Scan::Incomplete,
    }
}

/// Extracts the `h1,h2,h3,h4,p1,p2` endpoint a `227` PASV reply carries.
///
/// Scans permissively after the code: six numbers below 256, separated by
/// at most one comma and any amount of blank space, anywhere in the text.
/// A malformed group resets the collection and the scan continues.
#[must_use]
pub fn passive_endpoint(text: &str) -> Option<(Ipv4Addr, u16)> {
    let bytes = text.as_bytes();
    let mut nums = [0u8; 6];
    let mut count = 0usize;
    // Whether a separating comma is currently legal (one per gap).
    let mut comma_ok = false;
    let mut i = bytes.len().min(4);
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_digit() {
            let mut v: u32 = 0;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                v = v * 10 + u32::from(bytes[i] - b'0');
                i += 1;
                if v > 255 {
                    break;
                }
            }
            if v > 255 {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                count = 0;
                comma_ok = false;
                continue;
            }
            nums[count] = v as u8;
            count += 1;
            comma_ok = true;
            if count == 6 {
                return Some((
                    Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]),
                    (u16::from(nums[4]) << 8) | u16::from(nums[5]),
                ));
            }
        } else if b == b',' {
            if !comma_ok {
                count = 0;
            }
            comma_ok = false;
            i += 1;
        } else if b == b' ' || b == b'\t' {
            i += 1;
        } else {
            count = 0;
            comma_ok = false;
            i += 1;
        }
    }
    None
}

/// Extracts the `(1234 bytes)` style size note some servers append to
/// `150` replies. The unit word is required so an unrelated parenthesized
/// number does not count.
#[must_use]
pub fn size_in_parens(text: &str) -> Option<u64> {
    let bytes = text.as_bytes();
    let mut from = 0usize;
    while let Some(rel) = memchr(b'(', &bytes[from..]) {
        let mut p = from + rel + 1;
        from = p;
        let digits_start = p;
        let mut v: u64 = 0;
        while p < bytes.len() && bytes[p].is_ascii_digit() {
            v = v
                .saturating_mul(10)
                .saturating_add(u64::from(bytes[p] - b'0'));
            p += 1;
        }
        if p == digits_start {
            continue;
        }
        while p < bytes.len() && (bytes[p] == b' ' || bytes[p] == b'\t') {
            p += 1;
        }
        let word_start = p;
        while p < bytes.len() && bytes[p].is_ascii_alphabetic() {
            p += 1;
        }
        if p > word_start && p < bytes.len() && bytes[p] == b')' {
            return Some(v);
        }
    }
    None
}

/// Extracts the decimal size a `213` SIZE reply reports.
#[must_use]
pub fn size_from_reply(text: &str) -> Option<u64> {
    let rest = text.get(3..)?;
    let trimmed = rest.trim_start_matches([' ', '\t']);
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if end == 0 {
        return None;
    }
    trimmed[..end].parse().ok()
}

/// Extracts the quoted path from a `257` PWD reply.
///
/// Standard form is `"path"` with embedded quotes doubled; text before the
/// first quote is tolerated (VxWorks puts some there). Some localized
/// servers quote with apostrophes instead: when an apostrophe comes before
/// any double quote and no double quote follows the last apostrophe, the
/// path is what sits between the first and last apostrophe.
#[must_use]
pub fn directory_from_reply(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let first_quote = memchr(b'"', bytes);
    if let Some(a) = memrchr(b'\'', bytes).and_then(|last| {
        let first = memchr(b'\'', bytes)?;
        let quirk = first_quote.is_none_or(|q| first < q)
            && last > first
            && memchr(b'"', &bytes[last..]).is_none();
        quirk.then_some((first, last))
    }) {
        let (first, last) = a;
        return Some(String::from_utf8_lossy(&bytes[first + 1..last]).into_owned());
    }
    let q = first_quote?;
    let mut out = Vec::new();
    let mut p = q + 1;
    while p < bytes.len() {
        if bytes[p] == b'"' {
            if p + 1 < bytes.len() && bytes[p + 1] == b'"' {
                out.push(b'"');
                p += 2;
            } else {
                return Some(String::from_utf8_lossy(&out).into_owned());
            }
        } else {
            out.push(bytes[p]);
            p += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(a: &mut ReplyAssembler) -> Vec<Reply> {
        let mut out = Vec::new();
        while let Some(r) = a.next_reply() {
            out.push(r);
        }
        out
    }

    #[test]
    fn single_line_reply_completes_at_the_terminator() {
        let mut a = ReplyAssembler::new();
        a.push(b"220 Service ready");
        assert!(a.next_reply().is_none());
        a.push(b"\r\n");
        let r = a.next_reply().unwrap();
        assert_eq!(r.code, Some(220));
        assert_eq!(r.text, "220 Service ready\r\n");
        assert_eq!(a.pending_len(), 0);
    }

    #[test]
    fn bare_lf_terminates_a_line_too() {
        let mut a = ReplyAssembler::new();
        a.push(b"200 Ok\n");
        assert_eq!(a.next_reply().unwrap().code, Some(200));
    }

    #[test]
    fn multi_line_reply_waits_for_the_matching_final_line() {
        let mut a = ReplyAssembler::new();
        a.push(b"230-Welcome\r\n");
        assert!(a.next_reply().is_none());
        a.push(b"230-mid line\r\nplain text line\r\n");
        assert!(a.next_reply().is_none());
        a.push(b"230 Logged in.\r\n");
        let r = a.next_reply().unwrap();
        assert_eq!(r.code, Some(230));
        assert_eq!(r.lines().count(), 4);
        assert!(r.text.ends_with("230 Logged in.\r\n"));
    }

    #[test]
    fn continuation_opening_with_other_digits_does_not_finish_the_block() {
        let mut a = ReplyAssembler::new();
        a.push(b"211-Status\r\n212 not it\r\n211 End\r\n");
        let r = a.next_reply().unwrap();
        assert_eq!(r.code, Some(211));
        assert!(r.text.ends_with("211 End\r\n"));
    }

    #[test]
    fn pipelined_replies_drain_in_order() {
        let mut a = ReplyAssembler::new();
        a.push(b"200 first\r\n331 second\r\n");
        let out = drain(&mut a);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].code, Some(200));
        assert_eq!(out[1].code, Some(331));
    }

    #[test]
    fn byte_by_byte_feed_still_assembles() {
        let mut a = ReplyAssembler::new();
        for b in b"550 Failed\r\n" {
            a.push(&[*b]);
        }
        assert_eq!(a.next_reply().unwrap().code, Some(550));
    }

    #[test]
    fn non_ftp_line_comes_back_without_a_code() {
        let mut a = ReplyAssembler::new();
        a.push(b"SSH-2.0-OpenSSH_9.6\r\n");
        let r = a.next_reply().unwrap();
        assert_eq!(r.code, None);
        assert!(r.text.starts_with("SSH-2.0"));
    }

    #[test]
    fn endless_garbage_is_handed_back_at_the_cap() {
        let mut a = ReplyAssembler::new();
        a.push(&vec![b'x'; 1500]);
        let r = a.next_reply().unwrap();
        assert_eq!(r.code, None);
        assert_eq!(r.text.len(), 1000);
        assert_eq!(a.pending_len(), 500);
    }

    #[test]
    fn code_without_space_is_not_a_reply() {
        let mut a = ReplyAssembler::new();
        a.push(b"2300 what\r\n");
        assert_eq!(a.next_reply().unwrap().code, None);
    }

    #[test]
    fn categories_follow_the_leading_digit() {
        assert_eq!(ReplyCategory::of(150), Some(ReplyCategory::Preliminary));
        assert_eq!(ReplyCategory::of(226), Some(ReplyCategory::Success));
        assert_eq!(ReplyCategory::of(331), Some(ReplyCategory::Intermediate));
        assert_eq!(ReplyCategory::of(450), Some(ReplyCategory::Transient));
        assert_eq!(ReplyCategory::of(550), Some(ReplyCategory::Permanent));
        assert_eq!(ReplyCategory::of(621), None);
        assert_eq!(ReplyCategory::of(99), None);
    }

    #[test]
    fn welcome_means_connection_class_success() {
        let welcome = Reply {
            code: Some(220),
            text: String::new(),
        };
        assert!(welcome.is_welcome());
        let busy = Reply {
            code: Some(421),
            text: String::new(),
        };
        assert!(!busy.is_welcome());
        let plain_ok = Reply {
            code: Some(200),
            text: String::new(),
        };
        assert!(!plain_ok.is_welcome());
    }

    #[test]
    fn passive_endpoint_reads_the_standard_form() {
        let (ip, port) =
            passive_endpoint("227 Entering Passive Mode (192,168,0,12,4,21).\r\n").unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 0, 12));
        assert_eq!(port, 4 * 256 + 21);
    }

    #[test]
    fn passive_endpoint_tolerates_blank_space_and_decoration() {
        let (ip, port) = passive_endpoint("227 =192, 168 ,0,12 , 4, 21\r\n").unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 0, 12));
        assert_eq!(port, 1045);
    }

    #[test]
    fn oversized_group_resets_the_collection() {
        let (ip, _) = passive_endpoint("227 PASV 999,1,2,3 (10,0,0,1,8,0)\r\n").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
        assert!(passive_endpoint("227 no endpoint here\r\n").is_none());
    }

    #[test]
    fn size_note_needs_a_unit_word() {
        let text = "150 Opening BINARY mode data connection for f (4096 bytes).\r\n";
        assert_eq!(size_in_parens(text), Some(4096));
        assert_eq!(size_in_parens("150 About to open (section 2)\r\n"), None);
        assert_eq!(size_in_parens("150 Opening (12)(34 Bytes)\r\n"), Some(34));
        assert_eq!(size_in_parens("150 Opening data connection\r\n"), None);
    }

    #[test]
    fn size_reply_parses_the_leading_number() {
        assert_eq!(size_from_reply("213 4096\r\n"), Some(4096));
        assert_eq!(size_from_reply("213\r\n"), None);
        assert_eq!(size_from_reply("213 20201001112233 trailing\r\n"), Some(20_201_001_112_233));
    }

    #[test]
    fn pwd_path_between_double_quotes() {
        assert_eq!(
            directory_from_reply("257 \"/home/u\" is the current directory.\r\n").as_deref(),
            Some("/home/u")
        );
        assert_eq!(
            directory_from_reply("257 Current directory is \"/tmp\"\r\n").as_deref(),
            Some("/tmp")
        );
    }

    #[test]
    fn doubled_quotes_escape_a_literal_quote() {
        assert_eq!(
            directory_from_reply("257 \"/a\"\"b\" created.\r\n").as_deref(),
            Some("/a\"b")
        );
    }

    #[test]
    fn apostrophe_quoting_is_accepted_when_no_double_quote_follows() {
        assert_eq!(
            directory_from_reply("257 '/home/u' ist das aktuelle Verzeichnis\r\n").as_deref(),
            Some("/home/u")
        );
        // A double quote after the apostrophes wins the standard parse.
        assert_eq!(
            directory_from_reply("257 'x' then \"/real\" here\r\n").as_deref(),
            Some("/real")
        );
        assert_eq!(directory_from_reply("257 no quotes at all\r\n"), None);
    }
}
