//! Parsed `EXPLAIN (FORMAT JSON)` plan trees.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use super::PlanError;

/// Raw node as emitted by PostgreSQL. Field names follow the EXPLAIN output.
#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(rename = "Node Type")]
    node_type: String,
    #[serde(rename = "Total Cost", default)]
    total_cost: f64,
    #[serde(rename = "Plan Rows", default)]
    plan_rows: f64,
    #[serde(rename = "Actual Total Time")]
    actual_total_time: Option<f64>,
    #[serde(rename = "Actual Rows")]
    actual_rows: Option<f64>,
    #[serde(rename = "Relation Name")]
    relation_name: Option<String>,
    #[serde(rename = "Index Name")]
    index_name: Option<String>,
    #[serde(rename = "Join Type")]
    join_type: Option<String>,
    #[serde(rename = "Workers Planned")]
    workers_planned: Option<u32>,
    #[serde(rename = "Shared Hit Blocks", default)]
    shared_hit: u64,
    #[serde(rename = "Shared Read Blocks", default)]
    shared_read: u64,
    #[serde(rename = "Shared Dirtied Blocks", default)]
    shared_dirtied: u64,
    #[serde(rename = "Shared Written Blocks", default)]
    shared_written: u64,
    #[serde(rename = "Local Hit Blocks", default)]
    local_hit: u64,
    #[serde(rename = "Local Read Blocks", default)]
    local_read: u64,
    #[serde(rename = "Local Dirtied Blocks", default)]
    local_dirtied: u64,
    #[serde(rename = "Local Written Blocks", default)]
    local_written: u64,
    #[serde(rename = "Temp Read Blocks", default)]
    temp_read: u64,
    #[serde(rename = "Temp Written Blocks", default)]
    temp_written: u64,
    #[serde(rename = "Plans", default)]
    plans: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawExplain {
    #[serde(rename = "Plan")]
    plan: RawNode,
}

/// Block counters of one buffer class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCounts {
    pub hit: u64,
    pub read: u64,
    pub dirtied: u64,
    pub written: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferUsage {
    pub shared: BufferCounts,
    pub local: BufferCounts,
    /// Temp buffers only report reads and writes.
    pub temp: BufferCounts,
}

/// One node of a plan tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub plan_type: String,
    pub estimated_cost: f64,
    pub estimated_rows: f64,
    /// Present only for `EXPLAIN ANALYZE` output.
    pub actual_time: Option<f64>,
    pub actual_rows: Option<f64>,
    pub buffers: BufferUsage,
    pub relation_name: Option<String>,
    pub index_name: Option<String>,
    pub join_type: Option<String>,
    pub workers_planned: Option<u32>,
    pub children: Vec<QueryPlan>,
}

impl From<RawNode> for QueryPlan {
    fn from(raw: RawNode) -> Self {
        QueryPlan {
            plan_type: raw.node_type,
            estimated_cost: raw.total_cost,
            estimated_rows: raw.plan_rows,
            actual_time: raw.actual_total_time,
            actual_rows: raw.actual_rows,
            buffers: BufferUsage {
                shared: BufferCounts {
                    hit: raw.shared_hit,
                    read: raw.shared_read,
                    dirtied: raw.shared_dirtied,
                    written: raw.shared_written,
                },
                local: BufferCounts {
                    hit: raw.local_hit,
                    read: raw.local_read,
                    dirtied: raw.local_dirtied,
                    written: raw.local_written,
                },
                temp: BufferCounts {
                    read: raw.temp_read,
                    written: raw.temp_written,
                    ..Default::default()
                },
            },
            relation_name: raw.relation_name,
            index_name: raw.index_name,
            join_type: raw.join_type,
            workers_planned: raw.workers_planned,
            children: raw.plans.into_iter().map(QueryPlan::from).collect(),
        }
    }
}

impl QueryPlan {
    /// Parses the JSON array returned by `EXPLAIN (FORMAT JSON)`.
    pub fn parse_explain_json(json: &str) -> Result<Self, PlanError> {
        let mut explains: Vec<RawExplain> =
            serde_json::from_str(json).map_err(|e| PlanError::Parse(e.to_string()))?;
        if explains.is_empty() {
            return Err(PlanError::Parse("empty plan array".to_string()));
        }
        Ok(explains.swap_remove(0).plan.into())
    }

    /// Root cost estimate.
    pub fn total_cost(&self) -> f64 {
        self.estimated_cost
    }

    /// Depth-first walk over this node and all descendants.
    pub fn walk(&self) -> Vec<&QueryPlan> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let node = out[i];
            out.extend(node.children.iter());
            i += 1;
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.walk().len()
    }

    pub fn join_count(&self) -> usize {
        self.walk().iter().filter(|n| n.join_type.is_some()).count()
    }

    /// Distinct index names, in walk order.
    pub fn indexes_used(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for node in self.walk() {
            if let Some(idx) = node.index_name.as_deref()
                && !out.contains(&idx)
            {
                out.push(idx);
            }
        }
        out
    }

    pub fn is_parallel(&self) -> bool {
        self.walk()
            .iter()
            .any(|n| n.workers_planned.is_some_and(|w| w > 0))
    }

    /// Structural identity of the plan.
    ///
    /// Covers node types, join types, relations, indexes and parallelism in
    /// tree order; costs and row estimates are excluded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Xxh3::new();
        self.hash_structure(&mut hasher);
        format!("{:016x}", hasher.digest())
    }

    fn hash_structure(&self, h: &mut Xxh3) {
        h.update(b"(");
        h.update(self.plan_type.as_bytes());
        for (tag, value) in [
            (b"j:" as &[u8], &self.join_type),
            (b"r:", &self.relation_name),
            (b"i:", &self.index_name),
        ] {
            if let Some(v) = value {
                h.update(tag);
                h.update(v.as_bytes());
            }
        }
        if let Some(w) = self.workers_planned.filter(|w| *w > 0) {
            h.update(format!("parallel:{}", w).as_bytes());
        }
        for child in &self.children {
            child.hash_structure(h);
        }
        h.update(b")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::SIMPLE_PLAN_JSON;

    #[test]
    fn parses_nested_plan() {
        let plan = QueryPlan::parse_explain_json(SIMPLE_PLAN_JSON).unwrap();
        assert_eq!(plan.plan_type, "Hash Join");
        assert_eq!(plan.total_cost(), 245.75);
        assert_eq!(plan.node_count(), 4);
        assert_eq!(plan.join_count(), 1);
        assert_eq!(plan.indexes_used(), vec!["customers_pkey"]);
        assert!(!plan.is_parallel());
        assert_eq!(plan.children[0].relation_name.as_deref(), Some("orders"));
    }

    #[test]
    fn parses_buffers_and_actuals() {
        let json = r#"[{"Plan": {"Node Type": "Seq Scan", "Relation Name": "t",
            "Total Cost": 10.0, "Plan Rows": 5, "Actual Total Time": 0.42, "Actual Rows": 7,
            "Shared Hit Blocks": 3, "Shared Read Blocks": 2, "Temp Written Blocks": 1}}]"#;
        let plan = QueryPlan::parse_explain_json(json).unwrap();
        assert_eq!(plan.actual_time, Some(0.42));
        assert_eq!(plan.actual_rows, Some(7.0));
        assert_eq!(plan.buffers.shared.hit, 3);
        assert_eq!(plan.buffers.shared.read, 2);
        assert_eq!(plan.buffers.temp.written, 1);
    }

    #[test]
    fn fingerprint_ignores_costs_but_not_structure() {
        let base = QueryPlan::parse_explain_json(SIMPLE_PLAN_JSON).unwrap();
        let cheaper = SIMPLE_PLAN_JSON.replace("245.75", "99.0");
        let cheaper = QueryPlan::parse_explain_json(&cheaper).unwrap();
        assert_eq!(base.fingerprint(), cheaper.fingerprint());

        let seq = SIMPLE_PLAN_JSON.replace("\"Index Scan\"", "\"Seq Scan\"");
        let seq = QueryPlan::parse_explain_json(&seq).unwrap();
        assert_ne!(base.fingerprint(), seq.fingerprint());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            QueryPlan::parse_explain_json("not json"),
            Err(PlanError::Parse(_))
        ));
        assert!(matches!(
            QueryPlan::parse_explain_json("[]"),
            Err(PlanError::Parse(_))
        ));
    }
}
