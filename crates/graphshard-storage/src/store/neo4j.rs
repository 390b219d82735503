//! Neo4j-backed shard store.
//!
//! Talks to one Neo4j instance over its transactional HTTP endpoint
//! (`POST {base}/db/{database}/tx/commit`). Each batch is one `UNWIND`
//! statement, committed in its own transaction.

use super::{
    attributes_json, EdgeTarget, EdgeWrite, NodeWrite, Result, ShardStore, StoreError, PROXY_LABEL,
};
use graphshard_core::{EntityType, RelationType, ShardId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Basic-auth credentials of a shard.
#[derive(Debug, Clone)]
pub struct Neo4jAuth {
    pub username: String,
    pub password: String,
}

/// A shard stored in a Neo4j instance.
#[derive(Debug, Clone)]
pub struct Neo4jShardStore {
    shard: ShardId,
    commit_url: String,
    auth: Option<Neo4jAuth>,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<ServerError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<ResultRow>,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    code: String,
    message: String,
}

impl Neo4jShardStore {
    /// Creates a store for `shard` at `base_url` (e.g. `http://localhost:7474`).
    pub fn new(
        shard: ShardId,
        base_url: &str,
        database: &str,
        auth: Option<Neo4jAuth>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent("graphshard/0.1.0")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            shard,
            commit_url: format!("{}/db/{}/tx/commit", base_url.trim_end_matches('/'), database),
            auth,
            client,
        })
    }

    /// Endpoint the store commits to.
    pub fn commit_url(&self) -> &str {
        &self.commit_url
    }

    /// Runs statements in one transaction and sums the first column of every
    /// result row.
    fn commit(&self, statements: Vec<Value>) -> Result<usize> {
        if statements.is_empty() {
            return Ok(0);
        }
        let body = json!({ "statements": statements });

        let mut req = self.client.post(&self.commit_url).json(&body);
        if let Some(auth) = &self.auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }

        let resp = req.send()?;
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable {
                shard: self.shard,
                reason: format!("HTTP {}", resp.status()),
            });
        }

        let resp: CommitResponse = resp.json()?;
        if let Some(error) = resp.errors.into_iter().next() {
            return Err(StoreError::Rejected {
                shard: self.shard,
                code: error.code,
                message: error.message,
            });
        }

        let written = resp
            .results
            .iter()
            .flat_map(|result| &result.data)
            .filter_map(|row| row.row.first().and_then(Value::as_u64))
            .sum::<u64>();
        Ok(written as usize)
    }
}

fn statement(text: String, rows: Vec<Value>) -> Value {
    json!({ "statement": text, "parameters": { "rows": rows } })
}

fn node_statement(entity: EntityType) -> String {
    format!(
        "UNWIND $rows AS row \
         MERGE (n:{label} {{vid: row.vid}}) \
         SET n += row.props \
         RETURN count(n)",
        label = entity.label()
    )
}

fn direct_edge_statement(relation: RelationType) -> String {
    format!(
        "UNWIND $rows AS row \
         MATCH (a:{from} {{vid: row.from}}) \
         MATCH (b:{to} {{vid: row.to}}) \
         MERGE (a)-[r:{rel}]->(b) \
         SET r += row.props \
         RETURN count(r)",
        from = relation.from_type().label(),
        to = relation.to_type().label(),
        rel = relation.name()
    )
}

fn proxy_edge_statement(relation: RelationType) -> String {
    format!(
        "UNWIND $rows AS row \
         MATCH (a:{from} {{vid: row.from}}) \
         MATCH (p:{proxy} {{label: 'proxy'}}) \
         MERGE (a)-[r:{rel} {{target_vid: row.target_vid}}]->(p) \
         SET r += row.props \
         RETURN count(r)",
        from = relation.from_type().label(),
        proxy = PROXY_LABEL,
        rel = relation.name()
    )
}

impl ShardStore for Neo4jShardStore {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn ensure_proxy_node(&mut self) -> Result<()> {
        let text = format!("MERGE (:{PROXY_LABEL} {{label: 'proxy', dummy: true}})");
        self.commit(vec![json!({ "statement": text })])?;
        Ok(())
    }

    fn upsert_nodes(&mut self, entity: EntityType, batch: &[NodeWrite]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let rows = batch
            .iter()
            .map(|node| json!({ "vid": node.vid.0, "props": attributes_json(&node.attributes) }))
            .collect();
        let written = self.commit(vec![statement(node_statement(entity), rows)])?;
        debug!(shard = self.shard, entity = %entity, written, "Node batch committed");
        Ok(written)
    }

    fn upsert_edges(&mut self, relation: RelationType, batch: &[EdgeWrite]) -> Result<usize> {
        let mut direct = Vec::new();
        let mut proxied = Vec::new();
        for edge in batch {
            let props = attributes_json(&edge.attributes);
            match edge.target {
                EdgeTarget::Node(to) => {
                    direct.push(json!({ "from": edge.from.0, "to": to.0, "props": props }))
                }
                EdgeTarget::Proxy { target_vid, .. } => proxied.push(
                    json!({ "from": edge.from.0, "target_vid": target_vid.0, "props": props }),
                ),
            }
        }

        let mut statements = Vec::new();
        if !direct.is_empty() {
            statements.push(statement(direct_edge_statement(relation), direct));
        }
        if !proxied.is_empty() {
            statements.push(statement(proxy_edge_statement(relation), proxied));
        }
        let written = self.commit(statements)?;
        debug!(shard = self.shard, relation = %relation, written, "Edge batch committed");
        Ok(written)
    }
}
