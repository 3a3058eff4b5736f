//! Ant-style path matcher (C1) — `/literal`, `{name}`, `*`, `**`.
//! Spec §4.1, §8 "Path parameter extraction".

use rustc_hash::FxHashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    Star,
    DoubleStar,
}

fn segments(pattern: &str) -> Vec<Segment<'_>> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s == "**" {
                Segment::DoubleStar
            } else if s == "*" {
                Segment::Star
            } else if s.starts_with('{') && s.ends_with('}') && s.len() > 2 {
                Segment::Param(&s[1..s.len() - 1])
            } else {
                Segment::Literal(s)
            }
        })
        .collect()
}

/// Match is anchored on both ends, case-sensitive. Returns extracted named
/// parameters on success.
pub fn match_pattern(pattern: &str, path: &str) -> Option<FxHashMap<String, String>> {
    let pat = segments(pattern);
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut params = FxHashMap::default();
    if match_segments(&pat, &parts, &mut params) {
        Some(params)
    } else {
        None
    }
}

fn match_segments(
    pat: &[Segment<'_>],
    parts: &[&str],
    params: &mut FxHashMap<String, String>,
) -> bool {
    match pat.first() {
        None => parts.is_empty(),
        Some(Segment::DoubleStar) => {
            // Zero or more segments: try every split point, longest first
            // so a trailing literal tail still gets a chance to match.
            for i in (0..=parts.len()).rev() {
                let mut attempt = params.clone();
                if match_segments(&pat[1..], &parts[i..], &mut attempt) {
                    *params = attempt;
                    return true;
                }
            }
            false
        }
        Some(head) => {
            let Some((first, rest)) = parts.split_first() else {
                return false;
            };
            let ok = match head {
                Segment::Literal(lit) => *lit == *first,
                Segment::Star => true,
                Segment::Param(name) => {
                    params.insert((*name).to_string(), (*first).to_string());
                    true
                }
                Segment::DoubleStar => unreachable!(),
            };
            ok && match_segments(&pat[1..], rest, params)
        }
    }
}

/// Round-trips a parameter map back into the literal path the pattern
/// would have matched — used by property tests (spec §8) and available for
/// building links from a handler pattern.
pub fn build_path(pattern: &str, params: &FxHashMap<String, String>) -> Option<String> {
    let pat = segments(pattern);
    let mut out = String::new();
    for seg in pat {
        match seg {
            Segment::Literal(l) => {
                out.push('/');
                out.push_str(l);
            }
            Segment::Param(name) => {
                out.push('/');
                out.push_str(params.get(name)?);
            }
            Segment::Star | Segment::DoubleStar => return None,
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_param_segments() {
        let params = match_pattern("/users/{id}", "/users/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert!(match_pattern("/users/{id}", "/users/42/extra").is_none());
    }

    #[test]
    fn star_matches_one_segment() {
        assert!(match_pattern("/files/*", "/files/a.json").is_some());
        assert!(match_pattern("/files/*", "/files/a/b.json").is_none());
    }

    #[test]
    fn double_star_matches_zero_or_more_with_trailing_literal() {
        assert!(match_pattern("/files/**/meta", "/files/meta").is_some());
        assert!(match_pattern("/files/**/meta", "/files/a/b/meta").is_some());
        assert!(match_pattern("/files/**/meta", "/files/a/b/other").is_none());
    }

    #[test]
    fn build_path_round_trips_params() {
        let params = match_pattern("/users/{id}/posts/{postId}", "/users/7/posts/3").unwrap();
        let rebuilt = build_path("/users/{id}/posts/{postId}", &params).unwrap();
        assert_eq!(rebuilt, "/users/7/posts/3");
    }

    #[test]
    fn build_path_refuses_wildcard_patterns() {
        let params = Default::default();
        assert!(build_path("/files/*", &params).is_none());
    }
}
