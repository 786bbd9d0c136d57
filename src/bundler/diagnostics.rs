//! Normalize tool output into [`BuildError`]s
//!
//! Recognized shapes:
//!
//! - esbuild / vite: `✘ [ERROR] message` followed by an indented
//!   `file:line:column:` location
//! - webpack / rspack: `ERROR in ./file line:column` followed by the message
//! - TypeScript: `file(line,column): error TS1234: message`
//! - generic: `file:line:column: message`

use crate::error::BuildError;

pub const ADAPTER_UNAVAILABLE: &str = "ADAPTER_UNAVAILABLE";
pub const BUILD_FAILED: &str = "BUILD_FAILED";
pub const TIMEOUT: &str = "TIMEOUT";

/// Parse every error the tool reported; falls back to one error from the exit status
pub fn parse_failure(stdout: &str, stderr: &str, exit_code: Option<i32>) -> Vec<BuildError> {
    let mut errors = parse_errors(stderr);
    if errors.is_empty() {
        errors = parse_errors(stdout);
    }
    if errors.is_empty() {
        let last_line = last_meaningful_line(stderr).or_else(|| last_meaningful_line(stdout));
        let code = match exit_code {
            Some(code) => format!("EXIT_{}", code),
            None => BUILD_FAILED.to_string(),
        };
        let message = match (last_line, exit_code) {
            (Some(line), _) => line.to_string(),
            (None, Some(code)) => format!("build exited with status {}", code),
            (None, None) => "build terminated by signal".to_string(),
        };
        errors.push(BuildError::new(code, message));
    }
    errors
}

pub fn parse_errors(output: &str) -> Vec<BuildError> {
    let lines: Vec<&str> = output.lines().map(strip_ansi_prefix).collect();
    let mut errors = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();

        if let Some(message) = esbuild_error(line) {
            let location = lines[i + 1..]
                .iter()
                .take(4)
                .find_map(|l| parse_location(l.trim()));
            let mut err = BuildError::new(BUILD_FAILED, message);
            if let Some((file, ln, col, _)) = location {
                err = err.at(file, Some(ln), Some(col));
            }
            errors.push(err);
        } else if let Some(rest) = line.strip_prefix("ERROR in ") {
            let (file, ln, col) = webpack_location(rest);
            let message = lines[i + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .unwrap_or("webpack reported an error");
            let mut err = BuildError::new(BUILD_FAILED, message);
            err.file = Some(file);
            err.line = ln;
            err.column = col;
            errors.push(err);
        } else if let Some(err) = typescript_error(line) {
            errors.push(err);
        } else if let Some((file, ln, col, rest)) = parse_location(line) {
            let message = rest
                .trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace())
                .trim_start_matches("ERROR:")
                .trim_start_matches("error:")
                .trim();
            if !message.is_empty() {
                errors.push(BuildError::new(BUILD_FAILED, message).at(file, Some(ln), Some(col)));
            }
        }
        i += 1;
    }
    errors
}

fn esbuild_error(line: &str) -> Option<&str> {
    let idx = line.find("[ERROR]")?;
    Some(line[idx + "[ERROR]".len()..].trim())
}

/// `./src/index.ts 3:7-12` or `./src/index.ts`
fn webpack_location(rest: &str) -> (String, Option<u32>, Option<u32>) {
    let mut parts = rest.split_whitespace();
    let file = parts
        .next()
        .unwrap_or_default()
        .trim_start_matches("./")
        .to_string();
    let (line, column) = match parts.next().and_then(|pos| pos.split_once(':')) {
        Some((l, c)) => {
            let c = c.split('-').next().unwrap_or(c);
            (l.parse().ok(), c.parse().ok())
        }
        None => (None, None),
    };
    (file, line, column)
}

/// `src/a.ts(3,7): error TS2304: Cannot find name 'foo'.`
fn typescript_error(line: &str) -> Option<BuildError> {
    let marker = line.find("): error TS")?;
    let open = line[..marker].rfind('(')?;
    let file = &line[..open];
    let (ln, col) = line[open + 1..marker].split_once(',')?;
    let rest = &line[marker + "): error ".len()..];
    let (code, message) = rest.split_once(':')?;
    Some(
        BuildError::new(code.trim(), message.trim()).at(
            file.trim(),
            ln.trim().parse().ok(),
            col.trim().parse().ok(),
        ),
    )
}

/// Find the first `file:line:column` in a line; returns the remainder after the column
pub fn parse_location(line: &str) -> Option<(String, u32, u32, &str)> {
    for (idx, _) in line.match_indices(':') {
        let file = &line[..idx];
        if file.is_empty() || file.contains(char::is_whitespace) {
            continue;
        }
        let tail = &line[idx + 1..];
        let line_digits = tail.chars().take_while(|c| c.is_ascii_digit()).count();
        if line_digits == 0 || !tail[line_digits..].starts_with(':') {
            continue;
        }
        let after = &tail[line_digits + 1..];
        let col_digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if col_digits == 0 {
            continue;
        }
        let ln = tail[..line_digits].parse().ok()?;
        let col = after[..col_digits].parse().ok()?;
        return Some((file.to_string(), ln, col, &after[col_digits..]));
    }
    None
}

fn last_meaningful_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
}

/// Drop leading ANSI colour sequences tools emit even when piped
fn strip_ansi_prefix(line: &str) -> &str {
    let mut rest = line;
    while let Some(stripped) = rest.strip_prefix('\u{1b}') {
        match stripped.find('m') {
            Some(end) => rest = &stripped[end + 1..],
            None => break,
        }
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esbuild_format() {
        let out = "✘ [ERROR] Could not resolve \"./missing\"\n\n    src/index.ts:3:19:\n      3 │ import x from \"./missing\";\n";
        let errors = parse_errors(out);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Could not resolve \"./missing\"");
        assert_eq!(errors[0].file.as_deref(), Some("src/index.ts"));
        assert_eq!(errors[0].line, Some(3));
        assert_eq!(errors[0].column, Some(19));
    }

    #[test]
    fn test_webpack_format() {
        let out = "ERROR in ./src/app.js 12:4-9\nModule not found: Error: Can't resolve 'lodash'\n";
        let errors = parse_errors(out);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file.as_deref(), Some("src/app.js"));
        assert_eq!(errors[0].line, Some(12));
        assert_eq!(errors[0].column, Some(4));
        assert!(errors[0].message.starts_with("Module not found"));
    }

    #[test]
    fn test_typescript_format() {
        let out = "src/a.ts(3,7): error TS2304: Cannot find name 'foo'.";
        let errors = parse_errors(out);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "TS2304");
        assert_eq!(errors[0].file.as_deref(), Some("src/a.ts"));
        assert_eq!((errors[0].line, errors[0].column), (Some(3), Some(7)));
    }

    #[test]
    fn test_generic_format() {
        let errors = parse_errors("src/main.ts:10:2: ERROR: Expected \";\" but found \"}\"");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Expected \";\" but found \"}\"");
        assert_eq!(errors[0].line, Some(10));
    }

    #[test]
    fn test_fallback_uses_exit_code() {
        let errors = parse_failure("", "something went wrong\n", Some(2));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "EXIT_2");
        assert_eq!(errors[0].message, "something went wrong");

        let errors = parse_failure("", "", None);
        assert_eq!(errors[0].code, BUILD_FAILED);
    }

    #[test]
    fn test_ansi_prefix_stripped() {
        let errors = parse_errors("\u{1b}[31m✘ [ERROR] boom");
        assert_eq!(errors[0].message, "boom");
    }
}
