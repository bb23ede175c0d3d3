//! Byte-level comparison of two preprocessor outputs that tolerates the
//! differences a compiler cannot observe: whitespace-only lines, `#line`
//! renumbering, and lone closing braces that headers push around.
//!
//! Used when the digest of a fresh preprocessor run does not match the
//! accepted chain: if the outputs still compare equivalent, the new digest is
//! learned instead of recompiling.

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// isspace() minus the newline, which every loop here treats specially.
fn is_space_not_nl(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | 0x0b | 0x0c)
}

/// Parse a `#line`-style statement starting at `p`. Returns the stated line
/// number and the offset of the filename part (the rest of the line).
/// Tolerant the way the compiler is: interleaved blanks, short form, and no
/// insistence on quotes around the filename part.
fn parse_line_statement(b: &[u8], mut p: usize) -> Option<(u32, usize)> {
    if b.get(p) != Some(&b'#') {
        return None;
    }
    p += 1;

    while p < b.len() && is_blank(b[p]) {
        p += 1;
    }

    if b.len() - p >= 4 && &b[p..p + 4] == b"line" {
        // skip "line" and the separator after it
        p += 5;
        if p > b.len() {
            return None;
        }
    }

    if p >= b.len() || !b[p].is_ascii_digit() {
        return None;
    }
    let mut line: u32 = 0;
    while p < b.len() && b[p].is_ascii_digit() {
        line = line.wrapping_mul(10).wrapping_add((b[p] - b'0') as u32);
        p += 1;
    }

    // one or more blanks, then the filename part
    if p >= b.len() || !is_blank(b[p]) {
        return None;
    }
    while p < b.len() && is_blank(b[p]) {
        p += 1;
    }

    Some((line, p))
}

/// Scan backwards from `from` for the `#line` statement governing that
/// position. On success `line` is adjusted from a relative newline count to
/// the absolute line number, and the filename offset is returned.
fn find_file_statement(b: &[u8], from: usize, line: &mut u32) -> Option<usize> {
    let mut l = *line;
    let mut i = from as i64;
    while i >= 0 {
        let idx = i as usize;
        if idx < b.len() {
            if b[idx] == b'\n' {
                l += 1;
            } else if b[idx] == b'#' {
                let mut j = i - 1;
                while j >= 0 && is_blank(b[j as usize]) {
                    j -= 1;
                }
                if j < 0 || b[j as usize] == b'\n' {
                    if let Some((stmt_line, file)) = parse_line_statement(b, idx) {
                        *line = l.wrapping_add(stmt_line).wrapping_sub(1);
                        return Some(file);
                    }
                }
            }
        }
        i -= 1;
    }
    None
}

/// Advance `p` over lines a compiler cannot distinguish: blank lines, `#line`
/// statements (which update `line`/`file`), and lines holding a lone `}`
/// (counted in `curly`). Stops at the first comparable line or at the end.
fn skip_ignorable_lines(
    b: &[u8],
    mut p: usize,
    line: &mut u32,
    file: &mut Option<usize>,
    curly: &mut u32,
) -> usize {
    while p < b.len() {
        if b[p] == b'\n' {
            p += 1;
            *line += 1;
            continue;
        }

        let mut q = p;
        while q < b.len() && is_space_not_nl(b[q]) {
            q += 1;
        }

        if q < b.len() && b[q] == b'\n' {
            p = q + 1;
            *line += 1;
        } else if q < b.len() && b[q] == b'#' {
            match parse_line_statement(b, q) {
                Some((stmt_line, stmt_file)) => {
                    *line = stmt_line;
                    *file = Some(stmt_file);
                    p = match b[q..].iter().position(|&c| c == b'\n') {
                        Some(rel) => q + rel + 1,
                        None => b.len(),
                    };
                }
                None => break,
            }
        } else if q < b.len() && b[q] == b'}' {
            q += 1;
            while q < b.len() && is_space_not_nl(b[q]) {
                q += 1;
            }
            if q < b.len() && b[q] == b'\n' {
                *line += 1;
            } else if q != b.len() {
                break; // '}' followed by real content: comparable
            }
            *curly += 1;
            p = q;
        } else if q == b.len() {
            p = q;
        } else {
            break; // found something that can be compared
        }
    }
    p
}

/// Compare the remainder-of-line at the two filename offsets. End of buffer
/// terminates a reference the same way a newline does, but only a matching
/// terminator on the other side counts as agreement.
fn file_refs_agree(b1: &[u8], mut f1: usize, b2: &[u8], mut f2: usize) -> bool {
    loop {
        let c1 = b1.get(f1).copied().unwrap_or(0);
        let c2 = b2.get(f2).copied().unwrap_or(0);
        if c1 != c2 {
            return false;
        }
        if c1 == b'\n' || c1 == 0 {
            return true;
        }
        f1 += 1;
        f2 += 1;
    }
}

/// Are the two preprocessor outputs equivalent as compiler input?
pub fn outputs_equivalent(b1: &[u8], b2: &[u8]) -> bool {
    let e1 = b1.len();
    let e2 = b2.len();
    let mut p1 = 0usize;
    let mut p2 = 0usize;

    // Iterate block by block and backtrack when we find a difference.
    loop {
        let mut cch = (e1 - p1).min(e2 - p2).min(4096);
        if cch > 0 && b1[p1..p1 + cch] == b2[p2..p2 + cch] {
            p1 += cch;
            p2 += cch;
            continue;
        }

        // Pinpoint the difference.
        while cch >= 512 && b1[p1..p1 + 512] == b2[p2..p2 + 512] {
            p1 += 512;
            p2 += 512;
            cch -= 512;
        }
        while cch >= 64 && b1[p1..p1 + 64] == b2[p2..p2 + 64] {
            p1 += 64;
            p2 += 64;
            cch -= 64;
        }
        while cch > 0 && b1[p1] == b2[p2] {
            p1 += 1;
            p2 += 1;
            cch -= 1;
        }

        // Back up to the start of the line. The compared-equal prefix is
        // byte-identical, so the backtrack amount is valid on both sides.
        let mut ls = p1;
        while ls > 0 && b1[ls - 1] != b'\n' {
            ls -= 1;
        }
        p2 -= p1 - ls;
        p1 = ls;
        let mismatch1 = p1;
        let mismatch2 = p2;

        // Skip what the compiler cannot see, each side independently.
        let mut line1 = 0u32;
        let mut file1 = None;
        let mut curly1 = 0u32;
        p1 = skip_ignorable_lines(b1, p1, &mut line1, &mut file1, &mut curly1);

        let mut line2 = 0u32;
        let mut file2 = None;
        let mut curly2 = 0u32;
        p2 = skip_ignorable_lines(b2, p2, &mut line2, &mut file2, &mut curly2);

        // The number of ignored closing braces must agree.
        if curly1 != curly2 {
            return false;
        }

        // Reaching the end of either side lets the final check decide.
        if p1 == e1 || p2 == e2 {
            break;
        }

        // The comparable lines must be byte-identical.
        let next1 = match b1[p1..].iter().position(|&c| c == b'\n') {
            Some(rel) => p1 + rel + 1,
            None => e1,
        };
        let cch = next1 - p1;
        if p2 + cch > e2 {
            break;
        }
        if b1[p1..p1 + cch] != b2[p2..p2 + cch] {
            break;
        }

        // And both sides must agree on where that line lives.
        if file1.is_none() {
            file1 = find_file_statement(b1, mismatch1, &mut line1);
        }
        if file2.is_none() {
            file2 = find_file_statement(b2, mismatch2, &mut line2);
        }
        match (file1, file2) {
            (Some(f1), Some(f2)) => {
                if line1 != line2 {
                    break;
                }
                if !file_refs_agree(b1, f1, b2, f2) {
                    break;
                }
            }
            (None, None) => {}
            _ => break,
        }

        // Resume the lockstep compare past the agreed line.
        p1 += cch;
        p2 += cch;
    }

    p1 == e1 && p2 == e2
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_identical() {
        let x = b"int main(void)\n{\n    return 0;\n}\n";
        assert!(outputs_equivalent(x, x));
        assert!(outputs_equivalent(b"", b""));
    }

    #[test]
    fn test_blank_line_differences_equivalent() {
        let a = b"int x;\n\n\nint y;\n";
        let b = b"int x;\nint y;\n";
        assert!(outputs_equivalent(a, b));
        assert!(outputs_equivalent(b, a));

        let c = b"int x;\n   \t\nint y;\n";
        assert!(outputs_equivalent(b, c));
    }

    #[test]
    fn test_line_directives_equivalent_when_positions_agree() {
        // Same content, same effective positions, different spellings.
        let a = indoc! {b"
            int x;
            #line 10 \"f.h\"
            int y;
        "};
        let b = indoc! {b"
            int x;
            # 6 \"f.h\"




            int y;
        "};
        assert!(outputs_equivalent(a, b));
    }

    #[test]
    fn test_line_directives_position_disagreement() {
        let a = b"int x;\n#line 10 \"f.h\"\nint y;\n";
        let b = b"int x;\n#line 11 \"f.h\"\nint y;\n";
        assert!(!outputs_equivalent(a, b));

        let c = b"int x;\n#line 10 \"g.h\"\nint y;\n";
        assert!(!outputs_equivalent(a, c));
    }

    #[test]
    fn test_trailing_curly_rule() {
        // A lone '}' line is skippable around directive noise as long as both
        // sides skip the same number of them.
        let a = b"x;\n# 5 \"f\"\n}\ny;\n";
        let b = b"x;\n#line 5 \"f\"\n}\ny;\n";
        assert!(outputs_equivalent(a, b));

        // An extra closing brace on one side is a real difference.
        let c = b"int f();\n}\n";
        let d = b"int f();\n";
        assert!(!outputs_equivalent(c, d));

        // '}' with trailing content is comparable, not skippable.
        let e = b"x;\n} a\n";
        let f = b"x;\n} b\n";
        assert!(!outputs_equivalent(e, f));
    }

    #[test]
    fn test_real_change_not_equivalent() {
        let a = b"int x = 1;\nint y;\n";
        let b = b"int x = 2;\nint y;\n";
        assert!(!outputs_equivalent(a, b));

        // trailing extra content
        assert!(!outputs_equivalent(b"int x;\n", b"int x;\nint y;\n"));
    }

    #[test]
    fn test_parse_line_statement_forms() {
        assert_eq!(parse_line_statement(b"#line 12 \"f.h\"", 0), Some((12, 9)));
        assert_eq!(parse_line_statement(b"# 12 \"f.h\"", 0), Some((12, 5)));
        assert_eq!(parse_line_statement(b"# line 3  x", 0), Some((3, 10)));
        assert_eq!(parse_line_statement(b"#define X 1", 0), None);
        assert_eq!(parse_line_statement(b"# 12", 0), None); // no filename part
    }
}
