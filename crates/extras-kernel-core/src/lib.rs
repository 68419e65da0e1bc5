use std::cmp::Ordering;
use std::collections::BTreeMap;

use extras_kernel_fieldpath as fieldpath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context slot holding the flat extras document unless the caller picks
/// another key.
pub const CONTEXT_KEY_EXTRA_RESOURCES: &str = "apiextensions.crossplane.io/extra-resources";

/// Context slot holding the merged environment document.
pub const CONTEXT_KEY_ENVIRONMENT: &str = "apiextensions.crossplane.io/environment";

/// Type identity stamped onto an environment document that lacks one.
pub const ENVIRONMENT_API_VERSION: &str = "internal.crossplane.io/v1alpha1";
/// See [`ENVIRONMENT_API_VERSION`].
pub const ENVIRONMENT_KIND: &str = "Environment";

const DEFAULT_SORT_FIELD_PATH: &str = "metadata.name";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SelectError {
    /// The declared input is malformed. Not a data problem; the declaration
    /// itself must change.
    #[error("invalid declaration: {0}")]
    Declaration(String),
    /// A required reference or field path did not resolve against the
    /// supplied snapshot, or resolved ambiguously.
    #[error("resolution failed: {0}")]
    Resolution(String),
    /// A selector matched fewer resources than its declared minimum.
    #[error("cardinality violation: {0}")]
    Cardinality(String),
    /// The resolver response is missing an answer for a requirement it was
    /// asked for. A protocol bug, not a configuration problem.
    #[error("inconsistent resolver response: {0}")]
    Consistency(String),
    /// Values of incompatible kinds were sorted or merged together.
    #[error("incompatible value kind: {0}")]
    Kind(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum SourceType {
    #[default]
    Reference,
    Selector,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum MatcherType {
    Value,
    #[default]
    FromCompositeFieldPath,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum FieldPathPolicy {
    #[default]
    Required,
    Optional,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum ResolutionPolicy {
    #[default]
    Required,
    Optional,
}

/// Resolution policy applied to every Reference source of the declared list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    pub resolution: ResolutionPolicy,
}

impl Policy {
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.resolution == ResolutionPolicy::Optional
    }
}

/// One declared extra-resource request.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSource {
    #[serde(default, rename = "type")]
    pub source_type: SourceType,
    pub kind: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub reference: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ResourceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_field_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_field_path: Option<String>,
}

/// A named reference to a single extra resource.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResourceRef {
    pub name: String,
}

/// Label-based selection of zero or more extra resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSelector {
    pub match_labels: Vec<LabelMatcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_match: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_match: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by_field_path: Option<String>,
}

impl ResourceSelector {
    /// The declared sort path, or the default of sorting by object name.
    #[must_use]
    pub fn sort_field_path(&self) -> &str {
        self.sort_by_field_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .unwrap_or(DEFAULT_SORT_FIELD_PATH)
    }
}

/// One label constraint. The value is either a literal or drawn from a field
/// path of the target document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelMatcher {
    #[serde(default, rename = "type")]
    pub matcher_type: MatcherType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from_field_path: Option<String>,
    #[serde(default)]
    pub from_field_path_policy: FieldPathPolicy,
}

impl LabelMatcher {
    #[must_use]
    pub fn from_field_path_is_optional(&self) -> bool {
        self.from_field_path_policy == FieldPathPolicy::Optional
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum OutputMode {
    Context,
    #[default]
    Environment,
}

/// Where and how the projected document lands in the response context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSpec {
    pub mode: OutputMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,
}

impl OutputSpec {
    /// The context key the flat document is written to.
    #[must_use]
    pub fn context_slot(&self) -> &str {
        self.context_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .unwrap_or(CONTEXT_KEY_EXTRA_RESOURCES)
    }
}

/// The declared input: an ordered list of sources plus output configuration.
/// List order is significant; it fixes requirement keys and merge order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtrasSpec {
    pub extra_resources: Vec<ResourceSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    pub output: OutputSpec,
}

impl ExtrasSpec {
    fn reference_resolution_is_optional(&self) -> bool {
        self.policy.as_ref().is_some_and(Policy::is_optional)
    }
}

/// Resolver-facing description of what to fetch for one declared source.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub r#match: ResourceMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ResourceMatch {
    MatchName(String),
    MatchLabels(BTreeMap<String, String>),
}

/// The requirement key of the source at `index` of the declared list. Keys
/// derive from declaration order alone so resolver responses stay correlated
/// across renames of the destination path.
#[must_use]
pub fn requirement_key(index: usize) -> String {
    format!("resources-{index}")
}

/// One source's verified, ordered, extracted values.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerifiedExtras {
    pub source: ResourceSource,
    pub values: Vec<Value>,
}

/// Translate the declared sources into the requirements the resolver must
/// satisfy, resolving label values against the target composite document.
///
/// A Selector whose matchers all resolve to nothing is omitted entirely; it
/// contributes nothing to select on.
///
/// # Errors
/// Returns [`SelectError::Declaration`] for malformed sources and
/// [`SelectError::Resolution`] when a required label field path is absent
/// from the composite document.
pub fn build_requirements(
    spec: &ExtrasSpec,
    composite: &Value,
) -> Result<BTreeMap<String, Requirement>, SelectError> {
    let mut requirements = BTreeMap::new();
    for (index, source) in spec.extra_resources.iter().enumerate() {
        match source.source_type {
            SourceType::Reference => {
                let reference = source.reference.as_ref().ok_or_else(|| {
                    SelectError::Declaration(format!(
                        "extra resource {index} has type Reference but no ref.name"
                    ))
                })?;
                requirements.insert(
                    requirement_key(index),
                    Requirement {
                        api_version: source.api_version.clone(),
                        kind: source.kind.clone(),
                        namespace: source.namespace.clone(),
                        r#match: ResourceMatch::MatchName(reference.name.clone()),
                    },
                );
            }
            SourceType::Selector => {
                let selector = source.selector.as_ref().ok_or_else(|| {
                    SelectError::Declaration(format!(
                        "extra resource {index} has type Selector but no selector"
                    ))
                })?;
                let Some(labels) = resolve_match_labels(selector, composite, index)? else {
                    continue;
                };
                requirements.insert(
                    requirement_key(index),
                    Requirement {
                        api_version: source.api_version.clone(),
                        kind: source.kind.clone(),
                        namespace: source.namespace.clone(),
                        r#match: ResourceMatch::MatchLabels(labels),
                    },
                );
            }
        }
    }
    Ok(requirements)
}

fn resolve_match_labels(
    selector: &ResourceSelector,
    composite: &Value,
    index: usize,
) -> Result<Option<BTreeMap<String, String>>, SelectError> {
    let mut labels = BTreeMap::new();
    for matcher in &selector.match_labels {
        match matcher.matcher_type {
            MatcherType::Value => {
                let value = matcher.value.as_ref().ok_or_else(|| {
                    SelectError::Declaration(format!(
                        "label matcher {key:?} of extra resource {index} has no literal value",
                        key = matcher.key
                    ))
                })?;
                labels.insert(matcher.key.clone(), value.clone());
            }
            MatcherType::FromCompositeFieldPath => {
                let path = matcher.value_from_field_path.as_ref().ok_or_else(|| {
                    SelectError::Declaration(format!(
                        "label matcher {key:?} of extra resource {index} has no valueFromFieldPath",
                        key = matcher.key
                    ))
                })?;
                match fieldpath::get_string(composite, path) {
                    Ok(value) => {
                        labels.insert(matcher.key.clone(), value);
                    }
                    Err(_) if matcher.from_field_path_is_optional() => {}
                    Err(err) => {
                        return Err(SelectError::Resolution(format!(
                            "cannot get label value from field path {path:?}: {err}"
                        )));
                    }
                }
            }
        }
    }
    if labels.is_empty() {
        return Ok(None);
    }
    Ok(Some(labels))
}

/// Verify the raw matches the resolver returned for every declared source,
/// sort and trim Selector matches, and extract the requested values.
///
/// The result follows the declaration order of the sources, not the order of
/// the raw-match map. Sorting happens before `maxMatch` truncation, so the
/// sort key decides which matches survive.
///
/// # Errors
/// Returns [`SelectError::Consistency`] when a requirement key has no answer
/// at all, [`SelectError::Resolution`] for unresolved or ambiguous
/// references, [`SelectError::Cardinality`] below `minMatch`, and the sort
/// errors of [`sort_by_field_path`].
pub fn verify_and_sort(
    spec: &ExtrasSpec,
    raw: &BTreeMap<String, Vec<Value>>,
) -> Result<Vec<VerifiedExtras>, SelectError> {
    let optional_references = spec.reference_resolution_is_optional();
    let mut verified = Vec::with_capacity(spec.extra_resources.len());
    for (index, source) in spec.extra_resources.iter().enumerate() {
        let key = requirement_key(index);
        let Some(matches) = raw.get(&key) else {
            return Err(SelectError::Consistency(format!(
                "cannot find expected extra resources for requirement {key:?}"
            )));
        };
        match source.source_type {
            SourceType::Reference => {
                if matches.is_empty() {
                    if optional_references {
                        continue;
                    }
                    let name = source.reference.as_ref().map_or("", |r| r.name.as_str());
                    return Err(SelectError::Resolution(format!(
                        "required extra resource {name:?} (requirement {key:?}) did not resolve"
                    )));
                }
                if matches.len() > 1 {
                    return Err(SelectError::Resolution(format!(
                        "expected exactly one extra resource for requirement {key:?}, got {count}",
                        count = matches.len()
                    )));
                }
                verified.push(VerifiedExtras {
                    source: source.clone(),
                    values: extract_values(source, index, matches)?,
                });
            }
            SourceType::Selector => {
                let selector = source.selector.as_ref().ok_or_else(|| {
                    SelectError::Declaration(format!(
                        "extra resource {index} has type Selector but no selector"
                    ))
                })?;
                // minMatch counts what the resolver found, not what survives
                // truncation.
                if let Some(min) = selector.min_match {
                    if matches.len() < usize::try_from(min).unwrap_or(usize::MAX) {
                        return Err(SelectError::Cardinality(format!(
                            "expected at least {min} extra resources for requirement {key:?}, got {count}",
                            count = matches.len()
                        )));
                    }
                }
                let mut sorted = matches.clone();
                sort_by_field_path(&mut sorted, selector.sort_field_path())?;
                if let Some(max) = selector.max_match {
                    sorted.truncate(usize::try_from(max).unwrap_or(usize::MAX));
                }
                verified.push(VerifiedExtras {
                    source: source.clone(),
                    values: extract_values(source, index, &sorted)?,
                });
            }
        }
    }
    Ok(verified)
}

fn extract_values(
    source: &ResourceSource,
    index: usize,
    matches: &[Value],
) -> Result<Vec<Value>, SelectError> {
    match source.from_field_path.as_deref() {
        None => Ok(matches.to_vec()),
        Some("") => Err(SelectError::Declaration(format!(
            "extra resource {index} has an empty fromFieldPath; omit the field to select the whole object"
        ))),
        Some(path) => {
            let mut values = Vec::with_capacity(matches.len());
            for resource in matches {
                let value = fieldpath::get_value(resource, path).map_err(|err| {
                    SelectError::Resolution(format!(
                        "cannot extract {path:?} from a matched resource: {err}"
                    ))
                })?;
                values.push(value.clone());
            }
            Ok(values)
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SortKind {
    String,
    Int,
    Uint,
    Float,
}

impl SortKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
        }
    }
}

#[derive(Debug, Clone)]
enum SortKey {
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl SortKey {
    fn kind(&self) -> SortKind {
        match self {
            Self::String(_) => SortKind::String,
            Self::Int(_) => SortKind::Int,
            Self::Uint(_) => SortKind::Uint,
            Self::Float(_) => SortKind::Float,
        }
    }
}

/// Stable ascending sort of `resources` by the value each holds at `path`.
///
/// A missing path or JSON null counts as present-but-nil and sorts as the
/// zero value of the list's common kind; a list of only nils keeps its
/// original order. All non-nil values must share one kind; numeric kinds are
/// deliberately not coerced into one another.
///
/// # Errors
/// Returns [`SelectError::Declaration`] for an empty path,
/// [`SelectError::Resolution`] when a lookup fails with anything other than
/// "not found", and [`SelectError::Kind`] for heterogeneous or unsupported
/// (boolean, array, object) sort keys.
pub fn sort_by_field_path(resources: &mut [Value], path: &str) -> Result<(), SelectError> {
    if path.is_empty() {
        return Err(SelectError::Declaration("cannot sort by an empty field path".to_string()));
    }

    let mut keys = Vec::with_capacity(resources.len());
    let mut kind: Option<SortKind> = None;
    for resource in resources.iter() {
        let key = sort_key_at(resource, path)?;
        if let Some(key) = &key {
            match kind {
                None => kind = Some(key.kind()),
                Some(existing) if existing != key.kind() => {
                    return Err(SelectError::Kind(format!(
                        "cannot sort values of different kinds {existing:?} and {new:?} at {path:?}",
                        existing = existing.as_str(),
                        new = key.kind().as_str()
                    )));
                }
                Some(_) => {}
            }
        }
        keys.push(key);
    }

    // Every key nil: the input order is already the answer.
    let Some(kind) = kind else {
        return Ok(());
    };

    let mut order: Vec<usize> = (0..resources.len()).collect();
    order.sort_by(|&a, &b| compare_keys(kind, keys[a].as_ref(), keys[b].as_ref()));
    let sorted: Vec<Value> = order.iter().map(|&i| resources[i].clone()).collect();
    for (slot, value) in resources.iter_mut().zip(sorted) {
        *slot = value;
    }
    Ok(())
}

fn sort_key_at(resource: &Value, path: &str) -> Result<Option<SortKey>, SelectError> {
    let value = match fieldpath::get_value(resource, path) {
        Ok(value) => value,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => {
            return Err(SelectError::Resolution(format!(
                "cannot read sort key at {path:?}: {err}"
            )));
        }
    };
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(SortKey::String(s.clone()))),
        Value::Number(number) => {
            if let Some(i) = number.as_i64() {
                Ok(Some(SortKey::Int(i)))
            } else if let Some(u) = number.as_u64() {
                Ok(Some(SortKey::Uint(u)))
            } else if let Some(f) = number.as_f64() {
                Ok(Some(SortKey::Float(f)))
            } else {
                Err(SelectError::Kind(format!("unsupported numeric sort key at {path:?}")))
            }
        }
        other => Err(SelectError::Kind(format!(
            "unsupported sort key kind {found:?} at {path:?}",
            found = fieldpath::value_kind(other)
        ))),
    }
}

fn compare_keys(kind: SortKind, a: Option<&SortKey>, b: Option<&SortKey>) -> Ordering {
    match kind {
        SortKind::String => string_key(a).cmp(string_key(b)),
        SortKind::Int => int_key(a).cmp(&int_key(b)),
        SortKind::Uint => uint_key(a).cmp(&uint_key(b)),
        SortKind::Float => float_key(a).partial_cmp(&float_key(b)).unwrap_or(Ordering::Equal),
    }
}

fn string_key(key: Option<&SortKey>) -> &str {
    match key {
        Some(SortKey::String(s)) => s.as_str(),
        _ => "",
    }
}

fn int_key(key: Option<&SortKey>) -> i64 {
    match key {
        Some(SortKey::Int(i)) => *i,
        _ => 0,
    }
}

fn uint_key(key: Option<&SortKey>) -> u64 {
    match key {
        Some(SortKey::Uint(u)) => *u,
        _ => 0,
    }
}

fn float_key(key: Option<&SortKey>) -> f64 {
    match key {
        Some(SortKey::Float(f)) => *f,
        _ => 0.0,
    }
}

/// Flat projection: one keyed bag per source.
///
/// Every source's complete ordered value list lands at its `toFieldPath` as a
/// JSON array. Lists are never flattened or merged across sources.
///
/// # Errors
/// Returns [`SelectError::Declaration`] when a source has no usable
/// `toFieldPath` or the path cannot be written.
pub fn project_context(verified: &[VerifiedExtras]) -> Result<Value, SelectError> {
    let mut output = Map::new();
    for extras in verified {
        let Some(path) = non_empty(extras.source.to_field_path.as_deref()) else {
            return Err(SelectError::Declaration(format!(
                "extra resource of kind {kind:?} needs a toFieldPath to land in the context document",
                kind = extras.source.kind
            )));
        };
        fieldpath::set_value(&mut output, path, Value::Array(extras.values.clone())).map_err(
            |err| {
                SelectError::Declaration(format!(
                    "cannot write extracted values to {path:?}: {err}"
                ))
            },
        )?;
    }
    Ok(Value::Object(output))
}

/// Composite projection: deep-merge every extracted value into one
/// environment document.
///
/// Values with a `toFieldPath` are wrapped into a single-path document first;
/// values without one must already be objects. The pre-existing environment
/// (if any) is the merge base, so newly computed data overlays it and wins on
/// key collisions. The result is stamped with the default environment type
/// identity where it lacks one.
///
/// # Errors
/// Returns [`SelectError::Kind`] for a non-object value without a
/// destination path and [`SelectError::Declaration`] for unwritable paths.
pub fn project_environment(
    verified: &[VerifiedExtras],
    existing: Option<&Map<String, Value>>,
) -> Result<Value, SelectError> {
    let mut accumulated = Map::new();
    for extras in verified {
        for value in &extras.values {
            match non_empty(extras.source.to_field_path.as_deref()) {
                Some(path) => {
                    let mut overlay = Map::new();
                    fieldpath::set_value(&mut overlay, path, value.clone()).map_err(|err| {
                        SelectError::Declaration(format!(
                            "cannot write extracted value to {path:?}: {err}"
                        ))
                    })?;
                    accumulated = deep_merge(&accumulated, &overlay);
                }
                None => {
                    let Value::Object(object) = value else {
                        return Err(SelectError::Kind(format!(
                            "cannot merge a {found} into the environment without a toFieldPath",
                            found = fieldpath::value_kind(value)
                        )));
                    };
                    accumulated = deep_merge(&accumulated, object);
                }
            }
        }
    }

    let mut merged = match existing {
        Some(base) => deep_merge(base, &accumulated),
        None => accumulated,
    };
    if !merged.contains_key("apiVersion") {
        merged.insert("apiVersion".to_string(), Value::String(ENVIRONMENT_API_VERSION.to_string()));
    }
    if !merged.contains_key("kind") {
        merged.insert("kind".to_string(), Value::String(ENVIRONMENT_KIND.to_string()));
    }
    Ok(Value::Object(merged))
}

fn non_empty(path: Option<&str>) -> Option<&str> {
    path.filter(|p| !p.is_empty())
}

/// Recursive map merge into a new allocation. Keys of `overlay` win over
/// `base` unless both hold objects, which merge recursively. Precedence is
/// the parameter order; nothing is merged in place.
#[must_use]
pub fn deep_merge(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let merged_value = match (merged.get(key), value) {
            (Some(Value::Object(a)), Value::Object(b)) => Value::Object(deep_merge(a, b)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), merged_value);
    }
    merged
}
