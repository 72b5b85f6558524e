//! RPM epoch:version-release comparison.

use std::cmp::Ordering;

/// Split an EVR string into (epoch, version, release).
pub fn parse_evr(evr: &str) -> (i64, &str, &str) {
    let (epoch, rest) = match evr.split_once(':') {
        Some((e, rest)) => (e.parse().unwrap_or(0), rest),
        None => (0, evr),
    };
    let (version, release) = match rest.rsplit_once('-') {
        Some((v, r)) => (v, r),
        None => (rest, ""),
    };
    (epoch, version, release)
}

/// Compare two EVR strings with RPM semantics: epoch first, then version,
/// then release (release ignored when either side omits it).
pub fn evr_cmp(a: &str, b: &str) -> Ordering {
    let (ea, va, ra) = parse_evr(a);
    let (eb, vb, rb) = parse_evr(b);
    ea.cmp(&eb)
        .then_with(|| rpmvercmp(va, vb))
        .then_with(|| {
            if ra.is_empty() || rb.is_empty() {
                Ordering::Equal
            } else {
                rpmvercmp(ra, rb)
            }
        })
}

/// Whether `candidate` satisfies `op reference`.
pub fn evr_matches(candidate: &str, op: crate::resolver::pool::RelOp, reference: &str) -> bool {
    use crate::resolver::pool::RelOp;
    let cmp = evr_cmp(candidate, reference);
    match op {
        RelOp::Lt => cmp == Ordering::Less,
        RelOp::Le => cmp != Ordering::Greater,
        RelOp::Eq => cmp == Ordering::Equal,
        RelOp::Ge => cmp != Ordering::Less,
        RelOp::Gt => cmp == Ordering::Greater,
    }
}

/// rpm's segment-wise version comparison: alternating alphabetic and
/// numeric runs, numeric runs compare as integers and beat alphabetic ones,
/// `~` sorts before everything, `^` after the base version.
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut i = 0;
    let mut j = 0;

    while i < a.len() || j < b.len() {
        // tilde sorts lower than anything, including end of string
        let a_tilde = a.get(i) == Some(&'~');
        let b_tilde = b.get(j) == Some(&'~');
        if a_tilde || b_tilde {
            match (a_tilde, b_tilde) {
                (true, true) => {
                    i += 1;
                    j += 1;
                    continue;
                }
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                _ => unreachable!(),
            }
        }

        // caret sorts higher than end of string but lower than anything else
        let a_caret = a.get(i) == Some(&'^');
        let b_caret = b.get(j) == Some(&'^');
        if a_caret || b_caret {
            match (a_caret, b_caret) {
                (true, true) => {
                    i += 1;
                    j += 1;
                    continue;
                }
                (true, false) => {
                    return if j >= b.len() {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    };
                }
                (false, true) => {
                    return if i >= a.len() {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    };
                }
                _ => unreachable!(),
            }
        }

        // skip separators
        while i < a.len() && !a[i].is_ascii_alphanumeric() && a[i] != '~' && a[i] != '^' {
            i += 1;
        }
        while j < b.len() && !b[j].is_ascii_alphanumeric() && b[j] != '~' && b[j] != '^' {
            j += 1;
        }
        if i >= a.len() || j >= b.len() {
            break;
        }

        let a_digit = a[i].is_ascii_digit();
        let start_i = i;
        let start_j = j;
        if a_digit {
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            while i < a.len() && a[i].is_ascii_alphabetic() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_alphabetic() {
                j += 1;
            }
        }

        let seg_a: String = a[start_i..i].iter().collect();
        let seg_b: String = b[start_j..j].iter().collect();

        // a numeric segment always beats an alphabetic one
        if seg_b.is_empty() {
            return if a_digit {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let cmp = if a_digit {
            let na = seg_a.trim_start_matches('0');
            let nb = seg_b.trim_start_matches('0');
            na.len().cmp(&nb.len()).then_with(|| na.cmp(nb))
        } else {
            seg_a.cmp(&seg_b)
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }

    let rem_a = a.len().saturating_sub(i);
    let rem_b = b.len().saturating_sub(j);
    rem_a.cmp(&rem_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpmvercmp_basic() {
        assert_eq!(rpmvercmp("1.0", "1.0"), Ordering::Equal);
        assert_eq!(rpmvercmp("1.0", "2.0"), Ordering::Less);
        assert_eq!(rpmvercmp("2.0", "1.0"), Ordering::Greater);
        assert_eq!(rpmvercmp("2.0.1", "2.0"), Ordering::Greater);
        assert_eq!(rpmvercmp("9.1", "9.0"), Ordering::Greater);
        assert_eq!(rpmvercmp("10", "9"), Ordering::Greater);
        assert_eq!(rpmvercmp("1.05", "1.5"), Ordering::Equal);
    }

    #[test]
    fn test_rpmvercmp_alpha() {
        assert_eq!(rpmvercmp("1.0a", "1.0"), Ordering::Greater);
        assert_eq!(rpmvercmp("1.0a", "1.0b"), Ordering::Less);
        assert_eq!(rpmvercmp("a", "1"), Ordering::Less);
    }

    #[test]
    fn test_rpmvercmp_tilde() {
        assert_eq!(rpmvercmp("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(rpmvercmp("1.0~rc1", "1.0~rc2"), Ordering::Less);
        assert_eq!(rpmvercmp("1.0~rc1", "1.0~rc1"), Ordering::Equal);
    }

    #[test]
    fn test_rpmvercmp_caret() {
        assert_eq!(rpmvercmp("1.0^git1", "1.0"), Ordering::Greater);
        assert_eq!(rpmvercmp("1.0^git1", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_evr_cmp() {
        assert_eq!(evr_cmp("1.0-1.mga9", "1.0-2.mga9"), Ordering::Less);
        assert_eq!(evr_cmp("1:1.0-1.mga9", "2.0-1.mga9"), Ordering::Greater);
        assert_eq!(evr_cmp("120.0-1.mga9", "120.0-1.mga9"), Ordering::Equal);
        // release ignored when one side has none
        assert_eq!(evr_cmp("2.38", "2.38-1.mga9"), Ordering::Equal);
        assert_eq!(evr_cmp("2.30", "2.38-1.mga9"), Ordering::Less);
    }

    #[test]
    fn test_parse_evr() {
        assert_eq!(parse_evr("3:8.4.2-1.mga9"), (3, "8.4.2", "1.mga9"));
        assert_eq!(parse_evr("8.4.2-1.mga9"), (0, "8.4.2", "1.mga9"));
        assert_eq!(parse_evr("2.38"), (0, "2.38", ""));
    }
}
