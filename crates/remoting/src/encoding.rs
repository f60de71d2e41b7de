//! PowerShell command encoding.
//!
//! `powershell -encodedcommand` takes the script as base64 over UTF-16LE and
//! the command line that carries it is limited to [`ENCODED_COMMAND_LIMIT`]
//! characters. Longer scripts either go through the runspace transport or
//! are minified, gzipped and unpacked remotely by [`BOOTSTRAP`].

use std::io::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, write::GzEncoder};

/// Largest base64 payload accepted for `-encodedcommand`.
pub const ENCODED_COMMAND_LIMIT: usize = 8192;

/// Remote loader for compressed scripts. `<B64>` is replaced by the payload.
pub const BOOTSTRAP: &str = r"$B = '<B64>';
$ms = New-Object IO.MemoryStream(,[Convert]::FromBase64String($B))
$gs = New-Object IO.Compression.GzipStream($ms,[IO.Compression.CompressionMode]::Decompress)
$sr = New-Object IO.StreamReader($gs,[Text.Encoding]::UTF8)
$code = $sr.ReadToEnd(); $sr.Close(); $gs.Close(); $ms.Close()
iex $code
";

const BOOTSTRAP_PLACEHOLDER: &str = "<B64>";

/// Base64 of the script's UTF-16LE bytes, as `-encodedcommand` expects.
#[must_use]
pub fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

/// Length of [`encode_command`] output without building it.
#[must_use]
pub fn encoded_command_len(script: &str) -> usize {
    let utf16_bytes = script.encode_utf16().count() * 2;
    utf16_bytes.div_ceil(3) * 4
}

/// Whether the encoded script would exceed [`ENCODED_COMMAND_LIMIT`].
#[must_use]
pub fn exceeds_encoded_limit(script: &str) -> bool {
    encoded_command_len(script) > ENCODED_COMMAND_LIMIT
}

/// Gzips the UTF-8 text and base64-encodes the result.
///
/// # Errors
///
/// Returns the compressor's I/O error.
pub fn gzip_base64(text: &str) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(text.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Wraps a minified, compressed script in [`BOOTSTRAP`].
///
/// # Errors
///
/// Returns the compressor's I/O error.
pub fn bootstrap(script: &str) -> std::io::Result<String> {
    let payload = gzip_base64(&minify(script))?;
    Ok(BOOTSTRAP.replace(BOOTSTRAP_PLACEHOLDER, &payload))
}

/// Shrinks a PowerShell script without changing its meaning.
///
/// Comments (`# ...` and `<# ... #>`) are dropped, runs of blanks outside
/// string literals collapse to one space, blank lines disappear and the
/// remaining lines are joined with `;` unless the previous line continues
/// onto the next one (`{`, `|`, `` ` ``, `,`) or the next line closes a block.
#[must_use]
pub fn minify(script: &str) -> String {
    let stripped = strip_comments_and_blanks(script);

    let lines: Vec<&str> = stripped.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let mut out = String::with_capacity(stripped.len());
    for (i, line) in lines.iter().enumerate() {
        out.push_str(line);
        let Some(next) = lines.get(i + 1) else { break };
        let continues = line.ends_with(['{', '|', '`', ',', ';']);
        if !continues && !next.starts_with('}') {
            out.push(';');
        }
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

fn strip_comments_and_blanks(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    let mut chars = script.chars().peekable();
    let mut quote = Quote::None;
    // A `#` only opens a comment at the start of a token.
    let mut token_start = true;

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                out.push(c);
                if c == '\'' {
                    quote = Quote::None;
                }
            },
            Quote::Double => {
                out.push(c);
                if c == '`' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '"' {
                    quote = Quote::None;
                }
            },
            Quote::None => match c {
                '<' if chars.peek() == Some(&'#') => {
                    chars.next();
                    let mut prev = '\0';
                    for inner in chars.by_ref() {
                        if prev == '#' && inner == '>' {
                            break;
                        }
                        prev = inner;
                    }
                    token_start = true;
                },
                '#' if token_start => {
                    while chars.peek().is_some_and(|&n| n != '\n') {
                        chars.next();
                    }
                },
                ' ' | '\t' => {
                    while chars.peek().is_some_and(|&n| n == ' ' || n == '\t') {
                        chars.next();
                    }
                    out.push(' ');
                    token_start = true;
                },
                '\r' => {},
                '\n' => {
                    out.push('\n');
                    token_start = true;
                },
                '\'' => {
                    out.push(c);
                    quote = Quote::Single;
                    token_start = false;
                },
                '"' => {
                    out.push(c);
                    quote = Quote::Double;
                    token_start = false;
                },
                _ => {
                    out.push(c);
                    token_start = matches!(c, ';' | '{' | '}' | '(' | '|');
                },
            },
        }
    }
    out
}
