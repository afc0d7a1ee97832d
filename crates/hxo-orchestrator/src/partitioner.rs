//! Stage partitioning
//!
//! A partitioner explodes a stage's raw input into slices; each slice becomes
//! one content-addressed shard. Partitioning is pure: the same stage and
//! context always yield the same shard ids in the same order.
//!
//! Built-in partitioners and their inputs:
//!
//! | kind | input |
//! |---|---|
//! | `by_count` | `{"count": N}`, a bare number, or `{"items": [...], "batch_size": k}` |
//! | `by_module` | `{"modules": [...]}` or a bare array of module names |
//! | `by_file` | `{"files": [path or {"path", "size"}], "max_bytes": B, "max_files": F}` |
//! | `explicit` | `{"slices": [...]}` or a bare array; one shard per element |

use hxo_core::{HxoStage, PartitionError, PartitionerKind, ShardSpec};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 64;

/// Inputs to a partition call besides the stage itself
#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub plan_id: String,
    /// Shards this stage may still create within the plan's budget
    pub shard_budget: usize,
    /// Timeout for shards of stages without an SLO
    pub fallback_timeout_ms: u64,
}

impl PartitionContext {
    pub fn new(plan_id: impl Into<String>, shard_budget: usize, fallback_timeout_ms: u64) -> Self {
        Self {
            plan_id: plan_id.into(),
            shard_budget,
            fallback_timeout_ms,
        }
    }
}

/// A custom partitioner registered under its own name
pub trait Partition: Send + Sync {
    fn name(&self) -> &str;

    fn slices(&self, stage: &HxoStage) -> Result<Vec<Value>, PartitionError>;

    /// Finer slices replacing one pending slice during an autosplit
    fn refine(&self, payload: &Value, factor: u32) -> Vec<Value> {
        refine_payload(payload, factor)
    }
}

/// Immutable lookup of partitioners, built once at startup
#[derive(Clone, Default)]
pub struct PartitionerRegistry {
    custom: HashMap<String, Arc<dyn Partition>>,
}

#[derive(Default)]
pub struct PartitionerRegistryBuilder {
    custom: HashMap<String, Arc<dyn Partition>>,
}

impl PartitionerRegistryBuilder {
    pub fn register(mut self, partitioner: Arc<dyn Partition>) -> Self {
        self.custom.insert(partitioner.name().to_string(), partitioner);
        self
    }

    pub fn build(self) -> PartitionerRegistry {
        PartitionerRegistry {
            custom: self.custom,
        }
    }
}

impl PartitionerRegistry {
    pub fn builder() -> PartitionerRegistryBuilder {
        PartitionerRegistryBuilder::default()
    }

    /// Whether `kind` can be resolved
    pub fn supports(&self, kind: &PartitionerKind) -> bool {
        match kind {
            PartitionerKind::Custom(name) => self.custom.contains_key(name),
            _ => true,
        }
    }

    /// Explode a stage into shards
    ///
    /// Built-in partitioners check the shard count against the budget before
    /// building a single slice, so an oversized input fails fast instead of
    /// allocating.
    pub fn partition(
        &self,
        stage: &HxoStage,
        ctx: &PartitionContext,
    ) -> Result<Vec<ShardSpec>, PartitionError> {
        let budget = ctx.shard_budget;
        let slices = match &stage.partitioner {
            PartitionerKind::ByCount => by_count(&stage.input, budget)?,
            PartitionerKind::ByModule => by_module(&stage.input, budget)?,
            PartitionerKind::ByFile => by_file(&stage.input, budget)?,
            PartitionerKind::Explicit => explicit(&stage.input, budget)?,
            PartitionerKind::Custom(name) => self
                .custom
                .get(name)
                .ok_or_else(|| PartitionError::UnknownKind(name.clone()))?
                .slices(stage)?,
        };
        within_budget(slices.len() as u64, budget)?;

        Ok(slices
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                ShardSpec::new(&ctx.plan_id, stage, i as u64, payload, ctx.fallback_timeout_ms)
            })
            .collect())
    }

    /// Replace one pending shard with finer ones
    ///
    /// Numbered slices (`by_count`, `by_module`) refine to the same region cut
    /// into `factor` times as many parts, so part `i` of `n` becomes parts
    /// `i*f .. i*f+f` of `n*f`. List-bearing slices split their list. A slice that cannot
    /// be split yields nothing and the shard is kept as it is.
    ///
    /// The refined shards keep the parent's stage, timeout and creation
    /// sequence, and advance its generation.
    pub fn refine(&self, stage: &HxoStage, shard: &ShardSpec, factor: u32) -> Vec<ShardSpec> {
        let factor = factor.max(2);
        let payloads = match &stage.partitioner {
            PartitionerKind::Custom(name) => match self.custom.get(name) {
                Some(p) => p.refine(&shard.payload, factor),
                None => refine_payload(&shard.payload, factor),
            },
            PartitionerKind::ByCount => refine_count(&shard.payload, factor)
                .unwrap_or_else(|| refine_payload(&shard.payload, factor)),
            PartitionerKind::ByModule => refine_module(&shard.payload, factor)
                .unwrap_or_else(|| refine_payload(&shard.payload, factor)),
            PartitionerKind::ByFile | PartitionerKind::Explicit => {
                refine_payload(&shard.payload, factor)
            }
        };

        payloads
            .into_iter()
            .enumerate()
            .map(|(j, payload)| {
                let index = shard.partition_index * factor as u64 + j as u64;
                let mut child = ShardSpec::new(&shard.plan_id, stage, index, payload, shard.timeout_ms);
                child.generation = shard.generation + 1;
                child.seq = shard.seq;
                child
            })
            .collect()
    }
}

fn invalid(partitioner: &str, reason: impl Into<String>) -> PartitionError {
    PartitionError::InvalidInput {
        partitioner: partitioner.to_string(),
        reason: reason.into(),
    }
}

fn within_budget(produced: u64, budget: usize) -> Result<(), PartitionError> {
    if produced > budget as u64 {
        return Err(PartitionError::TooManyShards {
            produced: usize::try_from(produced).unwrap_or(usize::MAX),
            budget,
        });
    }
    Ok(())
}

/// Slices `range` of a count split into `total` parts
fn count_slices(total: u64, range: std::ops::Range<u64>) -> Vec<Value> {
    range.map(|i| json!({ "index": i, "of": total })).collect()
}

/// Slices `range` of a module split into `of` parts; an unsplit module has
/// no part fields
fn module_slices(name: &str, of: u64, range: std::ops::Range<u64>) -> Vec<Value> {
    if of == 1 {
        return vec![json!({ "module": name })];
    }
    range
        .map(|part| json!({ "module": name, "part": part, "of": of }))
        .collect()
}

fn by_count(input: &Value, budget: usize) -> Result<Vec<Value>, PartitionError> {
    let count = match input {
        Value::Null => return Ok(Vec::new()),
        Value::Number(n) => n.as_u64(),
        Value::Object(obj) => {
            if let Some(items) = obj.get("items") {
                let items = items
                    .as_array()
                    .ok_or_else(|| invalid("by_count", "items must be an array"))?;
                let batch = obj.get("batch_size").and_then(Value::as_u64).unwrap_or(1).max(1);
                within_budget((items.len() as u64).div_ceil(batch), budget)?;
                return Ok(items
                    .chunks(batch as usize)
                    .map(|chunk| json!({ "items": chunk }))
                    .collect());
            }
            obj.get("count").and_then(Value::as_u64)
        }
        _ => None,
    };
    let count = count.ok_or_else(|| invalid("by_count", "expected a count or items"))?;
    within_budget(count, budget)?;
    Ok(count_slices(count, 0..count))
}

fn by_module(input: &Value, budget: usize) -> Result<Vec<Value>, PartitionError> {
    let modules = match input {
        Value::Null => return Ok(Vec::new()),
        Value::Array(list) => list,
        Value::Object(obj) => obj
            .get("modules")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("by_module", "expected a modules array"))?,
        _ => return Err(invalid("by_module", "expected a modules array")),
    };

    within_budget(modules.len() as u64, budget)?;
    let mut slices = Vec::with_capacity(modules.len());
    for module in modules {
        let name = module
            .as_str()
            .ok_or_else(|| invalid("by_module", "module names must be strings"))?;
        slices.extend(module_slices(name, 1, 0..1));
    }
    Ok(slices)
}

fn by_file(input: &Value, budget: usize) -> Result<Vec<Value>, PartitionError> {
    let obj = match input {
        Value::Null => return Ok(Vec::new()),
        Value::Object(obj) => obj,
        _ => return Err(invalid("by_file", "expected an object with files")),
    };
    let files = obj
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("by_file", "expected a files array"))?;

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let entry = match file {
            Value::String(path) => (path.as_str(), 0u64),
            Value::Object(f) => {
                let path = f
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("by_file", "file entry without path"))?;
                (path, f.get("size").and_then(Value::as_u64).unwrap_or(0))
            }
            _ => return Err(invalid("by_file", "file entries must be paths or objects")),
        };
        entries.push(entry);
    }
    entries.sort();
    entries.dedup();

    let max_bytes = obj
        .get("max_bytes")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_BYTES)
        .max(1);
    let max_files = obj
        .get("max_files")
        .and_then(Value::as_u64)
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .unwrap_or(DEFAULT_MAX_FILES)
        .max(1);

    // Bin boundaries first; slices are built only once the count fits
    let mut starts: Vec<usize> = Vec::new();
    let mut bin_len = 0usize;
    let mut bin_bytes = 0u64;
    for (i, (_, size)) in entries.iter().enumerate() {
        let overflows =
            bin_len > 0 && (bin_bytes.saturating_add(*size) > max_bytes || bin_len >= max_files);
        if bin_len == 0 || overflows {
            starts.push(i);
            bin_len = 0;
            bin_bytes = 0;
        }
        bin_len += 1;
        bin_bytes = bin_bytes.saturating_add(*size);
    }
    within_budget(starts.len() as u64, budget)?;

    let mut slices = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(entries.len());
        let bin = &entries[start..end];
        let bytes = bin.iter().fold(0u64, |acc, (_, size)| acc.saturating_add(*size));
        let paths: Vec<&str> = bin.iter().map(|(path, _)| *path).collect();
        slices.push(json!({ "files": paths, "bytes": bytes }));
    }
    Ok(slices)
}

fn explicit(input: &Value, budget: usize) -> Result<Vec<Value>, PartitionError> {
    let list = match input {
        Value::Null => return Ok(Vec::new()),
        Value::Array(list) => list,
        Value::Object(obj) => obj
            .get("slices")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("explicit", "expected a slices array"))?,
        _ => return Err(invalid("explicit", "expected a slices array")),
    };
    within_budget(list.len() as u64, budget)?;
    Ok(list.clone())
}

/// `{"index": i, "of": n}` becomes parts `i*f .. i*f+f` of `n*f`
fn refine_count(payload: &Value, factor: u32) -> Option<Vec<Value>> {
    let index = payload.get("index")?.as_u64()?;
    let of = payload.get("of")?.as_u64()?;
    let f = factor as u64;
    let total = of.checked_mul(f)?;
    let first = index.checked_mul(f)?;
    Some(count_slices(total, first..first + f))
}

/// `{"module", "part": p, "of": n}` becomes parts `p*f .. p*f+f` of `n*f`
fn refine_module(payload: &Value, factor: u32) -> Option<Vec<Value>> {
    let name = payload.get("module")?.as_str()?;
    let part = payload.get("part").and_then(Value::as_u64).unwrap_or(0);
    let of = payload.get("of").and_then(Value::as_u64).unwrap_or(1);
    let f = factor as u64;
    let total = of.checked_mul(f)?;
    let first = part.checked_mul(f)?;
    Some(module_slices(name, total, first..first + f))
}

/// Default refinement: split a list-bearing slice into up to `factor` chunks.
/// Anything else cannot be split and yields nothing.
pub fn refine_payload(payload: &Value, factor: u32) -> Vec<Value> {
    let factor = factor.max(2) as usize;
    if let Value::Object(obj) = payload {
        for key in ["items", "files"] {
            if let Some(list) = obj.get(key).and_then(Value::as_array) {
                if list.len() > 1 {
                    let chunk = list.len().div_ceil(factor);
                    return list
                        .chunks(chunk)
                        .map(|part| {
                            let mut refined: Map<String, Value> = obj.clone();
                            refined.insert(key.to_string(), Value::Array(part.to_vec()));
                            refined.remove("bytes");
                            Value::Object(refined)
                        })
                        .collect();
                }
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ctx() -> PartitionContext {
        PartitionContext::new("plan-1", 1_000_000, 1_000)
    }

    fn stage(kind: PartitionerKind, input: Value) -> HxoStage {
        HxoStage::new("s1", "deploy.pack")
            .with_partitioner(kind)
            .with_input(input)
    }

    fn ids(shards: &[ShardSpec]) -> Vec<String> {
        shards.iter().map(|s| s.shard_id.clone()).collect()
    }

    #[test]
    fn test_partition_is_deterministic() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::ByCount, json!({"count": 25}));
        let a = registry.partition(&s, &ctx()).unwrap();
        let b = registry.partition(&s, &ctx()).unwrap();
        assert_eq!(a.len(), 25);
        assert_eq!(ids(&a), ids(&b));
        let unique: HashSet<_> = ids(&a).into_iter().collect();
        assert_eq!(unique.len(), 25);
    }

    #[test]
    fn test_by_count_accepts_bare_number_and_items() {
        let registry = PartitionerRegistry::default();
        let bare = registry
            .partition(&stage(PartitionerKind::ByCount, json!(4)), &ctx())
            .unwrap();
        assert_eq!(bare.len(), 4);

        let items = registry
            .partition(
                &stage(
                    PartitionerKind::ByCount,
                    json!({"items": [1, 2, 3, 4, 5], "batch_size": 2}),
                ),
                &ctx(),
            )
            .unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].payload, json!({"items": [5]}));
    }

    #[test]
    fn test_by_file_bins_by_size() {
        let registry = PartitionerRegistry::default();
        let s = stage(
            PartitionerKind::ByFile,
            json!({
                "files": [
                    {"path": "b.rs", "size": 60},
                    {"path": "a.rs", "size": 50},
                    {"path": "c.rs", "size": 30},
                    "d.rs"
                ],
                "max_bytes": 100
            }),
        );
        let shards = registry.partition(&s, &ctx()).unwrap();
        let files: Vec<Value> = shards.iter().map(|s| s.payload["files"].clone()).collect();
        assert_eq!(files, vec![json!(["a.rs"]), json!(["b.rs", "c.rs", "d.rs"])]);
    }

    #[test]
    fn test_empty_input_yields_no_shards() {
        let registry = PartitionerRegistry::default();
        let shards = registry
            .partition(&stage(PartitionerKind::Explicit, Value::Null), &ctx())
            .unwrap();
        assert!(shards.is_empty());
    }

    #[test]
    fn test_unknown_custom_kind_fails() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::Custom("by_dag_depth".into()), json!({}));
        assert!(!registry.supports(&s.partitioner));
        assert_eq!(
            registry.partition(&s, &ctx()).unwrap_err(),
            PartitionError::UnknownKind("by_dag_depth".into())
        );
    }

    #[test]
    fn test_budget_enforced() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::ByCount, json!({"count": 11}));
        let err = registry
            .partition(&s, &PartitionContext::new("p", 10, 1_000))
            .unwrap_err();
        assert!(matches!(err, PartitionError::TooManyShards { produced: 11, budget: 10 }));
    }

    #[test]
    fn test_malformed_input_is_partition_error() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::ByModule, json!({"modules": [1, 2]}));
        assert!(matches!(
            registry.partition(&s, &ctx()),
            Err(PartitionError::InvalidInput { .. })
        ));
    }

    struct Buckets;

    impl Partition for Buckets {
        fn name(&self) -> &str {
            "by_asset_bucket"
        }

        fn slices(&self, stage: &HxoStage) -> Result<Vec<Value>, PartitionError> {
            let n = stage.input["buckets"].as_u64().unwrap_or(0);
            Ok((0..n).map(|b| json!({ "bucket": b })).collect())
        }
    }

    #[test]
    fn test_custom_partitioner_registered() {
        let registry = PartitionerRegistry::builder()
            .register(Arc::new(Buckets))
            .build();
        let s = stage(
            PartitionerKind::Custom("by_asset_bucket".into()),
            json!({"buckets": 3}),
        );
        assert!(registry.supports(&s.partitioner));
        assert_eq!(registry.partition(&s, &ctx()).unwrap().len(), 3);
    }

    #[test]
    fn test_refine_payload_splits_lists_only() {
        let chunks = refine_payload(&json!({"items": [1, 2, 3, 4, 5], "bytes": 9}), 2);
        assert_eq!(chunks, vec![json!({"items": [1, 2, 3]}), json!({"items": [4, 5]})]);

        assert!(refine_payload(&json!({"items": [1]}), 2).is_empty());
        assert!(refine_payload(&json!({"target": "eu-west"}), 3).is_empty());
    }

    fn payloads(shards: &[ShardSpec]) -> Vec<Value> {
        shards.iter().map(|s| s.payload.clone()).collect()
    }

    #[test]
    fn test_refine_matches_finer_count() {
        let registry = PartitionerRegistry::default();
        let coarse = stage(PartitionerKind::ByCount, json!({"count": 5}));
        let fine = registry
            .partition(&stage(PartitionerKind::ByCount, json!({"count": 15})), &ctx())
            .unwrap();
        for (i, parent) in registry.partition(&coarse, &ctx()).unwrap().iter().enumerate() {
            let refined = registry.refine(&coarse, parent, 3);
            assert_eq!(payloads(&refined), payloads(&fine[i * 3..i * 3 + 3]));
        }
    }

    #[test]
    fn test_refine_splits_modules_into_parts() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::ByModule, json!(["api"]));
        let parent = registry.partition(&s, &ctx()).unwrap().remove(0);

        let halves = registry.refine(&s, &parent, 2);
        assert_eq!(
            payloads(&halves),
            vec![
                json!({"module": "api", "part": 0, "of": 2}),
                json!({"module": "api", "part": 1, "of": 2}),
            ]
        );
        let quarters = registry.refine(&s, &halves[1], 2);
        assert_eq!(
            payloads(&quarters),
            vec![
                json!({"module": "api", "part": 2, "of": 4}),
                json!({"module": "api", "part": 3, "of": 4}),
            ]
        );
    }

    #[test]
    fn test_refine_does_not_repeat_unsplittable_work() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::Explicit, json!({"slices": [{"target": "eu"}]}));
        let parent = registry.partition(&s, &ctx()).unwrap().remove(0);
        assert!(registry.refine(&s, &parent, 4).is_empty());
    }

    #[test]
    fn test_oversized_inputs_rejected_before_building() {
        let registry = PartitionerRegistry::default();
        let budget = PartitionContext::new("p", 10, 1_000);

        let huge = stage(PartitionerKind::ByCount, json!({"count": u64::MAX}));
        assert!(matches!(
            registry.partition(&huge, &budget),
            Err(PartitionError::TooManyShards { budget: 10, .. })
        ));

        let items = stage(
            PartitionerKind::ByCount,
            json!({"items": (0..11).collect::<Vec<u32>>()}),
        );
        assert!(registry.partition(&items, &budget).is_err());

        let modules = stage(PartitionerKind::ByModule, json!(["a", "b", "c", "d"]));
        assert!(registry
            .partition(&modules, &PartitionContext::new("p", 3, 1_000))
            .is_err());

        let files: Vec<String> = (0..11).map(|i| format!("f{:02}.rs", i)).collect();
        let by_file = stage(PartitionerKind::ByFile, json!({"files": files, "max_files": 1}));
        assert!(matches!(
            registry.partition(&by_file, &budget),
            Err(PartitionError::TooManyShards { produced: 11, budget: 10 })
        ));

        let slices = stage(PartitionerKind::Explicit, json!((0..11).collect::<Vec<u32>>()));
        assert!(registry.partition(&slices, &budget).is_err());
    }

    #[test]
    fn test_refined_shards_advance_generation() {
        let registry = PartitionerRegistry::default();
        let s = stage(PartitionerKind::ByCount, json!({"count": 2}));
        let mut parent = registry.partition(&s, &ctx()).unwrap().remove(1);
        parent.seq = 7;
        let children = registry.refine(&s, &parent, 2);
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.generation == 1 && c.seq == 7));
        assert_eq!(children[1].partition_index, 3);
        assert!(children.iter().all(|c| c.shard_id != parent.shard_id));
    }
}
