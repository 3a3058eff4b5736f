//! Pagination/filter engine (C4) — spec §4.4.

use crate::config::{
    AxisConfig, AxisSetting, Comparison, FilterConfig, FilterRule, PaginationConfig,
    PaginationMode, PaginationSource, ValueType,
};
use crate::error::{EngineError, Result};
use crate::request::Request;
use regex::RegexBuilder;
use serde_json::Value;

/// Resolved pagination parameters, already extracted from query/body.
#[derive(Debug, Default, Clone)]
pub struct ResolvedPagination {
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub sort: Option<String>,
    pub ascending: bool,
    pub has_sort: bool,
}

/// Merge a handler axis setting with the global one per spec §4.4 /
/// GLOSSARY: none disables, exclusive uses only the handler config,
/// inclusive merges (pagination fields take handler precedence, filter
/// rules concatenate).
fn resolve_pagination(
    handler: &AxisSetting<PaginationConfig>,
    global: Option<&PaginationConfig>,
) -> Option<PaginationConfig> {
    match handler.mode {
        PaginationMode::None => None,
        PaginationMode::Exclusive => handler.config.clone().or_else(|| global.cloned()),
        PaginationMode::Inclusive => {
            let g = global.cloned().unwrap_or_default();
            match &handler.config {
                Some(h) => Some(PaginationConfig {
                    source: h.source.or(g.source),
                    root: h.root.clone().or(g.root),
                    limit_field: h.limit_field.clone().or(g.limit_field),
                    skip_field: h.skip_field.clone().or(g.skip_field),
                    sort_field: h.sort_field.clone().or(g.sort_field),
                    order_field: h.order_field.clone().or(g.order_field),
                }),
                None => Some(g),
            }
        }
    }
}

fn resolve_filter(
    handler: &AxisSetting<FilterConfig>,
    global: Option<&FilterConfig>,
) -> Option<FilterConfig> {
    match handler.mode {
        PaginationMode::None => None,
        PaginationMode::Exclusive => handler.config.clone().or_else(|| global.cloned()),
        PaginationMode::Inclusive => {
            let g = global.cloned().unwrap_or_default();
            match &handler.config {
                Some(h) => {
                    let mut rules = g.rules.clone();
                    rules.extend(h.rules.clone());
                    Some(FilterConfig {
                        source: h.source.or(g.source),
                        root: h.root.clone().or(g.root),
                        rules,
                    })
                }
                None => Some(g),
            }
        }
    }
}

pub struct ResolvedAxis {
    pub pagination: Option<PaginationConfig>,
    pub filter: Option<FilterConfig>,
}

pub fn resolve(handler_axis: &AxisConfig, global_axis: Option<&AxisConfig>) -> ResolvedAxis {
    let global_pagination = global_axis.and_then(|g| g.pagination.config.as_ref());
    let global_filter = global_axis.and_then(|g| g.filter.config.as_ref());
    ResolvedAxis {
        pagination: resolve_pagination(&handler_axis.pagination, global_pagination),
        filter: resolve_filter(&handler_axis.filter, global_filter),
    }
}

/// Looks a field up from query params or (optionally rooted) body object.
/// "present" only if non-empty (spec §4.4).
fn lookup_source<'a>(req: &'a Request, source: PaginationSource, root: &Option<String>, field: &str) -> Option<String> {
    match source {
        PaginationSource::QueryParam => req.query.get(field).map(|s| s.to_string()),
        PaginationSource::Body => {
            let body = req.body.as_json()?;
            let base = match root {
                Some(r) => body.pointer(&format!("/{}", r.replace('.', "/")))?,
                None => body,
            };
            let v = base.get(field)?;
            match v {
                Value::String(s) if s.is_empty() => None,
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }
        }
    }
}

pub fn extract_pagination(req: &Request, cfg: &PaginationConfig) -> Result<ResolvedPagination> {
    let source = cfg.source.unwrap_or(PaginationSource::QueryParam);
    let mut out = ResolvedPagination::default();

    if let Some(field) = &cfg.limit_field {
        if let Some(raw) = lookup_source(req, source, &cfg.root, field) {
            let n: i64 = raw
                .parse()
                .map_err(|_| EngineError::client(400, "limit must be a number"))?;
            if n < 0 {
                return Err(EngineError::client(400, "limit must not be negative"));
            }
            out.limit = Some(n);
        }
    }
    if let Some(field) = &cfg.skip_field {
        if let Some(raw) = lookup_source(req, source, &cfg.root, field) {
            let n: i64 = raw
                .parse()
                .map_err(|_| EngineError::client(400, "skip must be a number"))?;
            if n < 0 {
                return Err(EngineError::client(400, "skip must not be negative"));
            }
            out.skip = Some(n);
        }
    }
    if let Some(field) = &cfg.sort_field {
        if let Some(raw) = lookup_source(req, source, &cfg.root, field) {
            out.sort = Some(raw);
            out.has_sort = true;
        }
    }
    out.ascending = true;
    if let Some(field) = &cfg.order_field {
        if let Some(raw) = lookup_source(req, source, &cfg.root, field) {
            out.ascending = match raw.as_str() {
                "ASC" | "1" | "true" => true,
                "DESC" | "-1" | "false" => false,
                _ => {
                    return Err(EngineError::client(
                        400,
                        "order must be one of ASC, DESC, 1, -1, true, false",
                    ))
                }
            };
        }
    }
    Ok(out)
}

/// Applies sort (stable) then skip then limit to a JSON array. Applying
/// pagination twice with the same params is a no-op the second time
/// (spec §8 "Pagination idempotence") because skip/limit only ever shrink
/// the array and sort is already applied.
pub fn apply_pagination(items: &mut Vec<Value>, p: &ResolvedPagination) {
    if p.has_sort {
        if let Some(field) = &p.sort {
            let field = field.clone();
            let ascending = p.ascending;
            items.sort_by(|a, b| {
                let av = a.get(&field).cloned().unwrap_or(Value::Null);
                let bv = b.get(&field).cloned().unwrap_or(Value::Null);
                let ord = compare_values(&av, &bv);
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
    }
    if let Some(skip) = p.skip {
        let skip = skip as usize;
        if skip >= items.len() {
            items.clear();
        } else {
            items.drain(0..skip);
        }
    }
    if let Some(limit) = p.limit {
        let limit = limit as usize;
        if items.len() > limit {
            items.truncate(limit);
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Extracts filter rule values from the same source as pagination and
/// applies each rule, ANDing all matches. Returns the surviving elements
/// and whether any rule was actually evaluated (a file with no filters
/// configured, or with all rule values absent, performs no filtering).
pub fn apply_filters(req: &Request, cfg: &FilterConfig, items: Vec<Value>) -> Result<Vec<Value>> {
    let mask = filter_mask(req, cfg, &items)?;
    Ok(items.into_iter().zip(mask).filter(|(_, keep)| *keep).map(|(v, _)| v).collect())
}

/// Per-element match mask for `items` against `cfg`, without discarding
/// anything — lets callers (e.g. DELETE, which needs to know exactly
/// which elements matched even when values repeat) act on indices instead
/// of re-deriving matches by value equality.
pub fn filter_mask(req: &Request, cfg: &FilterConfig, items: &[Value]) -> Result<Vec<bool>> {
    let source = cfg.source.unwrap_or(PaginationSource::QueryParam);
    let mut active: Vec<(&FilterRule, String)> = Vec::new();
    for rule in &cfg.rules {
        if let Some(raw) = lookup_source(req, source, &cfg.root, &rule.key) {
            active.push((rule, raw));
        }
    }
    if active.is_empty() {
        return Ok(vec![true; items.len()]);
    }
    let mut mask = Vec::with_capacity(items.len());
    for item in items {
        let mut matched = true;
        for (rule, raw) in &active {
            if !eval_rule(item, rule, raw)? {
                matched = false;
                break;
            }
        }
        mask.push(matched);
    }
    Ok(mask)
}

fn get_nested<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let mut cur = value;
    for part in key.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn parse_date_epoch(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis())
        })
}

fn coerce_scalar(raw: &str, vt: ValueType) -> Value {
    match vt {
        ValueType::Number | ValueType::NumberArray => {
            raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null)
        }
        ValueType::Boolean | ValueType::BooleanArray => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Null,
        },
        ValueType::Date | ValueType::DateArray => parse_date_epoch(raw)
            .map(|ms| Value::Number(serde_json::Number::from(ms)))
            .unwrap_or(Value::Null),
        _ => Value::String(raw.to_string()),
    }
}

fn is_array_type(vt: ValueType) -> bool {
    matches!(
        vt,
        ValueType::StringArray | ValueType::NumberArray | ValueType::BooleanArray | ValueType::DateArray
    )
}

fn coerce_filter_value(raw: &str, vt: ValueType) -> Value {
    if is_array_type(vt) {
        let items: Vec<Value> = raw.split(',').map(|p| coerce_scalar(p.trim(), vt)).collect();
        Value::Array(items)
    } else {
        coerce_scalar(raw, vt)
    }
}

fn value_as_epoch(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => parse_date_epoch(s),
        _ => None,
    }
}

fn ordering_cmp(field: &Value, filter: &Value, is_date: bool) -> Option<std::cmp::Ordering> {
    if is_date {
        let a = value_as_epoch(field)?;
        let b = value_as_epoch(filter)?;
        return Some(a.cmp(&b));
    }
    match (field, filter) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn eval_rule(item: &Value, rule: &FilterRule, raw: &str) -> Result<bool> {
    let field = get_nested(item, &rule.key).cloned().unwrap_or(Value::Null);
    let is_date = matches!(rule.value_type, ValueType::Date | ValueType::DateArray);

    match rule.comparison {
        Comparison::Eq => {
            let target = coerce_filter_value(raw, rule.value_type);
            Ok(field == target)
        }
        Comparison::Ne => {
            let target = coerce_filter_value(raw, rule.value_type);
            Ok(field != target)
        }
        Comparison::Lt | Comparison::Lte | Comparison::Gt | Comparison::Gte => {
            let target = coerce_scalar(raw, rule.value_type);
            let ord = ordering_cmp(&field, &target, is_date);
            Ok(match (rule.comparison, ord) {
                (Comparison::Lt, Some(o)) => o.is_lt(),
                (Comparison::Lte, Some(o)) => o.is_le(),
                (Comparison::Gt, Some(o)) => o.is_gt(),
                (Comparison::Gte, Some(o)) => o.is_ge(),
                _ => false,
            })
        }
        Comparison::In | Comparison::Nin => {
            let target = coerce_filter_value(raw, rule.value_type);
            let membership = match (&field, &target) {
                (Value::Array(items), Value::Array(wanted)) => {
                    wanted.iter().all(|w| items.contains(w))
                }
                (Value::Array(items), single) => items.contains(single),
                (single, Value::Array(wanted)) => wanted.contains(single),
                (a, b) => a == b,
            };
            Ok(if matches!(rule.comparison, Comparison::In) { membership } else { !membership })
        }
        Comparison::Regex => {
            let mut builder = RegexBuilder::new(raw);
            if let Some(flags) = &rule.regex_flags {
                if flags.contains('i') {
                    builder.case_insensitive(true);
                }
                if flags.contains('m') {
                    builder.multi_line(true);
                }
                if flags.contains('s') {
                    builder.dot_matches_new_line(true);
                }
            }
            let re = builder
                .build()
                .map_err(|e| EngineError::client(400, format!("invalid regex: {e}")))?;
            let as_string = match &field {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            Ok(re.is_match(&as_string))
        }
    }
}

/// Pagination/filters apply only to a JSON array; a JSON object is
/// collapsed to a one-element sequence and re-collapsed after (spec §3
/// invariant). Returns `None` if `value` is neither array nor object.
pub fn as_sequence(value: &Value) -> Option<(Vec<Value>, bool)> {
    match value {
        Value::Array(items) => Some((items.clone(), true)),
        Value::Object(_) => Some((vec![value.clone()], false)),
        _ => None,
    }
}

pub fn from_sequence(items: Vec<Value>, was_array: bool) -> Value {
    if was_array {
        Value::Array(items)
    } else {
        items.into_iter().next().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use serde_json::json;

    fn req_with_query(query: &str) -> Request {
        Request::new(Method::Get, format!("/items?{query}"))
    }

    #[test]
    fn pagination_sorts_skips_and_limits() {
        let req = req_with_query("sort=age&order=DESC&skip=1&limit=1");
        let cfg = PaginationConfig {
            source: Some(PaginationSource::QueryParam),
            root: None,
            limit_field: Some("limit".to_string()),
            skip_field: Some("skip".to_string()),
            sort_field: Some("sort".to_string()),
            order_field: Some("order".to_string()),
        };
        let resolved = extract_pagination(&req, &cfg).unwrap();
        let mut items = vec![json!({"age": 10}), json!({"age": 30}), json!({"age": 20})];
        apply_pagination(&mut items, &resolved);
        assert_eq!(items, vec![json!({"age": 20})]);
    }

    #[test]
    fn negative_limit_is_rejected() {
        let req = req_with_query("limit=-1");
        let cfg = PaginationConfig { limit_field: Some("limit".to_string()), ..Default::default() };
        assert!(extract_pagination(&req, &cfg).is_err());
    }

    #[test]
    fn filter_mask_evaluates_eq_rule_and_preserves_positions() {
        let req = req_with_query("status=active");
        let cfg = FilterConfig {
            source: Some(PaginationSource::QueryParam),
            root: None,
            rules: vec![FilterRule {
                key: "status".to_string(),
                value_type: ValueType::String,
                comparison: Comparison::Eq,
                regex_flags: None,
            }],
        };
        let items = vec![json!({"status": "active"}), json!({"status": "inactive"}), json!({"status": "active"})];
        let mask = filter_mask(&req, &cfg, &items).unwrap();
        assert_eq!(mask, vec![true, false, true]);
    }

    #[test]
    fn object_collapses_to_single_element_sequence_and_back() {
        let obj = json!({"id": 1});
        let (seq, was_array) = as_sequence(&obj).unwrap();
        assert_eq!(seq, vec![obj.clone()]);
        assert_eq!(from_sequence(seq, was_array), obj);
    }
}
