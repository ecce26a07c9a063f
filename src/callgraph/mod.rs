// Call-graph service.
//
// Resolves a symbol (stable id → qualname/name → fuzzy fallback), then
// walks callers and callees breadth-first under one shared budget of
// nodes, edges, depth, and wall time. Each edge carries a confidence score
// that penalizes high fan-in targets; low-confidence edges are pruned.
// Output is a tree payload plus an ASCII rendering with summary and
// precision footers.

pub mod plugins;
pub mod render;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::database::SearchDatabase;
use crate::database::relations::NeighborRow;
use crate::database::symbols::SymbolHit;

pub use plugins::{CallGraphPlugin, PluginContext};

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Line,
    Name,
}

/// Inputs for one call-graph build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallGraphRequest {
    pub symbol: String,
    pub symbol_id: Option<String>,
    pub path: Option<String>,
    pub repo: Option<String>,
    pub root_ids: Vec<String>,
    pub depth: usize,
    pub max_nodes: usize,
    pub max_edges: usize,
    pub max_depth: usize,
    pub max_time_ms: u64,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub sort: SortBy,
}

impl Default for CallGraphRequest {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            symbol_id: None,
            path: None,
            repo: None,
            root_ids: Vec::new(),
            depth: 2,
            max_nodes: 400,
            max_edges: 1200,
            max_depth: 0, // 0 = follow `depth`
            max_time_ms: 2000,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            sort: SortBy::Line,
        }
    }
}

/// One node of the rendered graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub path: String,
    pub symbol_id: String,
    pub line: i64,
    pub rel_type: String,
    pub confidence: f64,
    pub children: Vec<GraphNode>,
}

/// Graph summary counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSummary {
    pub upstream_count: usize,
    pub downstream_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphMeta {
    pub nodes: usize,
    pub edges: usize,
    pub depth: usize,
    pub max_nodes: usize,
    pub max_edges: usize,
    pub max_time_ms: u64,
    pub repo: String,
    pub root_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallGraphResult {
    pub symbol: String,
    pub symbol_id: String,
    pub path: String,
    /// Candidates when resolution was ambiguous (trees left empty).
    pub matches: Vec<SymbolHit>,
    pub upstream: GraphNode,
    pub downstream: GraphNode,
    pub tree: String,
    pub truncated: bool,
    pub truncate_reason: String,
    /// low | med | high
    pub graph_quality: String,
    pub precision_hint: String,
    pub quality_score: u8,
    pub scope_reason: String,
    pub meta: GraphMeta,
    pub summary: GraphSummary,
    pub plugin_warnings: Vec<String>,
}

/// Shared traversal budget. Every check that fails flips `truncated` and
/// records the specific reason.
pub struct GraphBudget {
    max_nodes: usize,
    max_edges: usize,
    max_time_ms: u64,
    pub nodes: usize,
    pub edges: usize,
    pub truncated: bool,
    pub truncate_reason: String,
    started: Instant,
}

impl GraphBudget {
    pub fn new(max_nodes: usize, max_edges: usize, max_time_ms: u64) -> Self {
        Self {
            max_nodes,
            max_edges,
            max_time_ms,
            nodes: 0,
            edges: 0,
            truncated: false,
            truncate_reason: String::new(),
            started: Instant::now(),
        }
    }

    pub fn check_time(&mut self) -> bool {
        if self.max_time_ms == 0 {
            return true;
        }
        if self.started.elapsed().as_millis() as u64 > self.max_time_ms {
            self.truncated = true;
            self.truncate_reason = "time_budget_exceeded".to_string();
            return false;
        }
        true
    }

    pub fn can_add_node(&mut self) -> bool {
        if !self.check_time() {
            return false;
        }
        if self.nodes >= self.max_nodes {
            self.truncated = true;
            self.truncate_reason = "node_budget_exceeded".to_string();
            return false;
        }
        true
    }

    pub fn can_add_edge(&mut self) -> bool {
        if !self.check_time() {
            return false;
        }
        if self.edges >= self.max_edges {
            self.truncated = true;
            self.truncate_reason = "edge_budget_exceeded".to_string();
            return false;
        }
        true
    }
}

/// Per-edge confidence: common-path-prefix affinity minus a fan-in
/// penalty, clamped to [0.1, 1.0].
pub fn calculate_confidence(from_path: &str, to_path: &str, fan_in: i64) -> f64 {
    let mut score = 0.5;
    if !from_path.is_empty() && !to_path.is_empty() {
        let a: Vec<&str> = from_path.split('/').collect();
        let b: Vec<&str> = to_path.split('/').collect();
        let mut common = 0usize;
        for i in 0..a.len().min(b.len()) {
            if a[i] == b[i] {
                common += 1;
            } else {
                break;
            }
        }
        score += common as f64 / a.len().max(b.len()) as f64 * 0.15;
    }
    if fan_in > 50 {
        score -= 0.8;
    }
    score.clamp(0.1, 1.0)
}

/// Edges below this confidence are pruned outright.
const CONFIDENCE_PRUNE: f64 = 0.05;

pub struct CallGraphService {
    db: Arc<SearchDatabase>,
    plugins: Vec<Arc<dyn CallGraphPlugin>>,
}

impl CallGraphService {
    pub fn new(db: Arc<SearchDatabase>) -> Self {
        Self {
            db,
            plugins: Vec::new(),
        }
    }

    pub fn with_plugins(db: Arc<SearchDatabase>, plugins: Vec<Arc<dyn CallGraphPlugin>>) -> Self {
        Self { db, plugins }
    }

    /// Build the graph for one request.
    pub fn build(&self, req: &CallGraphRequest) -> Result<CallGraphResult> {
        if req.symbol.trim().is_empty() && req.symbol_id.is_none() {
            anyhow::bail!("symbol is required");
        }
        let effective_max_depth = if req.max_depth == 0 {
            req.depth
        } else {
            req.max_depth
        };
        let depth = req.depth.min(effective_max_depth);
        let mut scope_reason = format!(
            "root_ids={}; repo={}",
            if req.root_ids.is_empty() {
                "any".to_string()
            } else {
                req.root_ids.join(",")
            },
            req.repo.as_deref().unwrap_or("any")
        );

        let mut matches = self.db.resolve_symbol(
            req.symbol.trim(),
            req.path.as_deref(),
            req.symbol_id.as_deref(),
            &req.root_ids,
            req.repo.as_deref(),
        )?;

        if matches.is_empty() && !req.symbol.trim().is_empty() {
            let fuzzy = self
                .db
                .fuzzy_search_symbols(req.symbol.trim(), 3, &req.root_ids)?;
            if let Some(best) = fuzzy.into_iter().next() {
                scope_reason.push_str(&format!(
                    " (exact match failed, using fuzzy match for '{}')",
                    best.name
                ));
                matches = vec![best];
            }
        }

        if matches.is_empty() {
            return Ok(self.empty_result(req, depth, scope_reason));
        }
        if req.path.is_none() && req.symbol_id.is_none() && matches.len() > 1 {
            // Ambiguous: hand the candidate list back, trees empty.
            let mut result = self.empty_result(req, depth, scope_reason);
            result.matches = matches;
            return Ok(result);
        }

        let target = matches[0].clone();
        let mut budget = GraphBudget::new(req.max_nodes, req.max_edges, req.max_time_ms);
        budget.nodes += 1; // The root node counts against the budget.
        let mut warnings: Vec<String> = Vec::new();

        let allow = |path: &str| -> bool {
            if path.is_empty() {
                return false;
            }
            if !req.root_ids.is_empty()
                && !req
                    .root_ids
                    .iter()
                    .any(|r| path == r || path.starts_with(&format!("{r}/")))
            {
                return false;
            }
            if !req.include_paths.is_empty()
                && !req.include_paths.iter().any(|p| fnmatch_path(p, path))
            {
                return false;
            }
            if req.exclude_paths.iter().any(|p| fnmatch_path(p, path)) {
                return false;
            }
            true
        };

        let mut enriched = false;
        let mut rel_density = 0usize;
        let mut visited: HashSet<(String, String, String)> = HashSet::new();
        let upstream = self.build_tree(
            &target,
            depth,
            Direction::Up,
            &mut visited,
            &mut budget,
            &allow,
            &mut enriched,
            &mut rel_density,
            &mut warnings,
        )?;
        let mut visited: HashSet<(String, String, String)> = HashSet::new();
        let downstream = self.build_tree(
            &target,
            depth,
            Direction::Down,
            &mut visited,
            &mut budget,
            &allow,
            &mut enriched,
            &mut rel_density,
            &mut warnings,
        )?;

        let summary = GraphSummary {
            upstream_count: upstream.children.len(),
            downstream_count: downstream.children.len(),
        };
        let graph_quality = if budget.truncated
            || (summary.upstream_count == 0 && summary.downstream_count == 0)
        {
            "low"
        } else if summary.upstream_count > 0
            && summary.downstream_count > 0
            && budget.nodes >= 10
        {
            "high"
        } else {
            "med"
        };
        let precision_hint = precision_hint(&target.path);
        let quality_score =
            self.quality_score(&target.path, &precision_hint, enriched, rel_density);

        let mut result = CallGraphResult {
            symbol: target.name.clone(),
            symbol_id: target.symbol_id.clone(),
            path: target.path.clone(),
            matches: vec![target],
            upstream,
            downstream,
            tree: String::new(),
            truncated: budget.truncated,
            truncate_reason: budget.truncate_reason.clone(),
            graph_quality: graph_quality.to_string(),
            precision_hint,
            quality_score,
            scope_reason,
            meta: GraphMeta {
                nodes: budget.nodes,
                edges: budget.edges,
                depth,
                max_nodes: req.max_nodes,
                max_edges: req.max_edges,
                max_time_ms: req.max_time_ms,
                repo: req.repo.clone().unwrap_or_default(),
                root_ids: req.root_ids.clone(),
            },
            summary,
            plugin_warnings: warnings,
        };
        result.tree = render::render_tree(&result, req.sort);
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_tree(
        &self,
        origin: &SymbolHit,
        depth: usize,
        direction: Direction,
        visited: &mut HashSet<(String, String, String)>,
        budget: &mut GraphBudget,
        allow: &dyn Fn(&str) -> bool,
        enriched: &mut bool,
        rel_density: &mut usize,
        warnings: &mut Vec<String>,
    ) -> Result<GraphNode> {
        self.expand_node(
            &origin.name,
            &origin.path,
            &origin.symbol_id,
            depth,
            direction,
            visited,
            budget,
            allow,
            enriched,
            rel_density,
            warnings,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_node(
        &self,
        name: &str,
        path: &str,
        symbol_id: &str,
        depth: usize,
        direction: Direction,
        visited: &mut HashSet<(String, String, String)>,
        budget: &mut GraphBudget,
        allow: &dyn Fn(&str) -> bool,
        enriched: &mut bool,
        rel_density: &mut usize,
        warnings: &mut Vec<String>,
    ) -> Result<GraphNode> {
        let mut node = GraphNode {
            name: name.to_string(),
            path: path.to_string(),
            symbol_id: symbol_id.to_string(),
            confidence: 1.0,
            ..Default::default()
        };
        if depth == 0 {
            return Ok(node);
        }
        let key = (
            direction.as_str().to_string(),
            if symbol_id.is_empty() {
                name.to_string()
            } else {
                symbol_id.to_string()
            },
            path.to_string(),
        );
        if !visited.insert(key) {
            // Cycle: terminate this branch.
            return Ok(node);
        }
        if !budget.check_time() {
            return Ok(node);
        }

        let path_opt = if path.is_empty() { None } else { Some(path) };
        let sid_opt = if symbol_id.is_empty() {
            None
        } else {
            Some(symbol_id)
        };
        let mut neighbors = match direction {
            Direction::Up => self.db.callers_for(name, path_opt, sid_opt, &[])?,
            Direction::Down => self.db.callees_for(name, path_opt, sid_opt, &[])?,
        };
        self.enrich_neighbors(&mut neighbors, path, enriched);
        self.apply_plugins(direction, &mut neighbors, name, path, warnings);
        *rel_density += neighbors.len();

        let names: Vec<String> = {
            let mut unique: Vec<String> =
                neighbors.iter().map(|n| n.symbol.clone()).collect();
            unique.sort();
            unique.dedup();
            unique
        };
        let fan_in = self.db.symbol_fan_in(&names)?;

        let mut scored: Vec<(f64, NeighborRow)> = neighbors
            .into_iter()
            .map(|n| {
                let conf = calculate_confidence(
                    path,
                    &n.path,
                    fan_in.get(&n.symbol).copied().unwrap_or(0),
                );
                (conf, n)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.path.cmp(&b.1.path))
                .then(a.1.line.cmp(&b.1.line))
        });

        for (confidence, neighbor) in scored {
            if confidence < CONFIDENCE_PRUNE || !allow(&neighbor.path) {
                continue;
            }
            if !budget.can_add_edge() || !budget.can_add_node() {
                break;
            }
            budget.edges += 1;
            budget.nodes += 1;

            let mut child = self.expand_node(
                &neighbor.symbol,
                &neighbor.path,
                &neighbor.symbol_id,
                depth - 1,
                direction,
                visited,
                budget,
                allow,
                enriched,
                rel_density,
                warnings,
            )?;
            child.line = neighbor.line;
            child.rel_type = neighbor.rel_type;
            child.confidence = confidence;
            node.children.push(child);
        }
        Ok(node)
    }

    /// Resolve missing symbol ids on neighbor rows via unique-name lookup,
    /// scoped directory → root → global.
    fn enrich_neighbors(&self, neighbors: &mut [NeighborRow], anchor_path: &str, enriched: &mut bool) {
        for neighbor in neighbors.iter_mut() {
            if !neighbor.symbol_id.is_empty() || neighbor.symbol.is_empty() {
                continue;
            }
            let dir_scope = anchor_path
                .rsplit_once('/')
                .map(|(dir, _)| format!("{dir}/"));
            let root_scope = anchor_path
                .split_once('/')
                .map(|(root, _)| format!("{root}/"));

            let hit = dir_scope
                .as_deref()
                .and_then(|scope| self.db.lookup_unique_symbol(&neighbor.symbol, Some(scope)))
                .or_else(|| {
                    root_scope.as_deref().and_then(|scope| {
                        self.db.lookup_unique_symbol(&neighbor.symbol, Some(scope))
                    })
                })
                .or_else(|| self.db.lookup_unique_symbol(&neighbor.symbol, None));
            if let Some((path, symbol_id)) = hit {
                *enriched = true;
                neighbor.symbol_id = symbol_id;
                if neighbor.path.is_empty() {
                    neighbor.path = path;
                }
            }
        }
    }

    fn apply_plugins(
        &self,
        direction: Direction,
        neighbors: &mut Vec<NeighborRow>,
        name: &str,
        path: &str,
        warnings: &mut Vec<String>,
    ) {
        if self.plugins.is_empty() {
            return;
        }
        let ctx = PluginContext {
            symbol: name.to_string(),
            path: path.to_string(),
            direction: direction.as_str().to_string(),
        };
        for plugin in &self.plugins {
            if let Err(e) = plugin.augment_neighbors(&ctx, neighbors) {
                warnings.push(format!("plugin augment failed: {e}"));
            }
            if let Err(e) = plugin.filter_neighbors(&ctx, neighbors) {
                warnings.push(format!("plugin filter failed: {e}"));
            }
        }
    }

    fn quality_score(
        &self,
        path: &str,
        precision_hint: &str,
        enriched: bool,
        rel_density: usize,
    ) -> u8 {
        let mut base: i64 = if precision_hint.starts_with("high") {
            85
        } else if precision_hint.starts_with("low") {
            30
        } else {
            60
        };
        if rel_density >= 20 {
            base += 5;
        } else if rel_density <= 2 {
            base -= 5;
        }
        if !path.is_empty() {
            if let Some(meta) = self.db.get_file_meta(path) {
                if meta.size > 200_000 {
                    base -= 10;
                } else if meta.size < 5_000 {
                    base += 5;
                }
            }
        }
        if enriched {
            base += 10;
        }
        base.clamp(0, 100) as u8
    }

    fn empty_result(
        &self,
        req: &CallGraphRequest,
        depth: usize,
        scope_reason: String,
    ) -> CallGraphResult {
        CallGraphResult {
            symbol: req.symbol.clone(),
            symbol_id: req.symbol_id.clone().unwrap_or_default(),
            path: req.path.clone().unwrap_or_default(),
            graph_quality: "low".to_string(),
            scope_reason,
            meta: GraphMeta {
                depth,
                max_nodes: req.max_nodes,
                max_edges: req.max_edges,
                max_time_ms: req.max_time_ms,
                repo: req.repo.clone().unwrap_or_default(),
                root_ids: req.root_ids.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Static precision tier by file extension. Every language here is
/// parsed by the regex tier, so all of them report low; an AST-backed
/// parser would report high. Unknown extensions sit at medium.
pub fn precision_hint(path: &str) -> String {
    let ext = path.rsplit_once('.').map(|x| x.1.to_lowercase());
    match ext.as_deref() {
        Some("py") => "low (regex Python)".to_string(),
        Some("js") | Some("jsx") => "low (regex JS)".to_string(),
        Some("ts") | Some("tsx") => "low (regex TS)".to_string(),
        Some("java") => "low (regex Java)".to_string(),
        Some("kt") => "low (regex Kotlin)".to_string(),
        Some("go") => "low (regex Go)".to_string(),
        Some("rs") => "low (regex Rust)".to_string(),
        Some("c") | Some("h") => "low (regex C/C++)".to_string(),
        Some("cpp") => "low (regex C++)".to_string(),
        _ => "medium".to_string(),
    }
}

fn fnmatch_path(pattern: &str, path: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(path))
        .unwrap_or(false)
        || path.starts_with(pattern)
        || path.contains(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::types::{FileRecord, RelationRecord, SymbolRecord};

    fn db_with_graph() -> Arc<SearchDatabase> {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        let files: Vec<FileRecord> = ["root-1/app/main.py", "root-1/app/util.py"]
            .iter()
            .map(|p| FileRecord {
                path: p.to_string(),
                repo: "demo".to_string(),
                mtime: 100,
                size: 500,
                content: "code".to_string(),
                parse_status: "ok".to_string(),
                ..Default::default()
            })
            .collect();
        db.upsert_files(&files).unwrap();
        db
    }

    fn symbol(path: &str, name: &str, line: i64) -> SymbolRecord {
        SymbolRecord {
            symbol_id: SymbolRecord::compute_id(path, "function", name),
            path: path.to_string(),
            name: name.to_string(),
            qualname: name.to_string(),
            kind: "function".to_string(),
            line,
            end_line: line + 5,
            ..Default::default()
        }
    }

    fn edge(from_path: &str, from: &str, to_path: &str, to: &str, line: i64) -> RelationRecord {
        RelationRecord {
            from_path: from_path.to_string(),
            from_symbol: from.to_string(),
            from_symbol_id: SymbolRecord::compute_id(from_path, "function", from),
            to_path: to_path.to_string(),
            to_symbol: to.to_string(),
            to_symbol_id: SymbolRecord::compute_id(to_path, "function", to),
            rel_type: "calls".to_string(),
            line,
        }
    }

    #[test]
    fn resolves_and_walks_both_directions() {
        let db = db_with_graph();
        db.upsert_symbols(&[
            symbol("root-1/app/main.py", "main", 1),
            symbol("root-1/app/util.py", "helper", 1),
            symbol("root-1/app/util.py", "leaf", 20),
        ])
        .unwrap();
        db.upsert_relations(&[
            edge("root-1/app/main.py", "main", "root-1/app/util.py", "helper", 3),
            edge("root-1/app/util.py", "helper", "root-1/app/util.py", "leaf", 5),
        ])
        .unwrap();

        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "helper".to_string(),
                depth: 2,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(result.symbol, "helper");
        assert_eq!(result.summary.upstream_count, 1);
        assert_eq!(result.summary.downstream_count, 1);
        assert_eq!(result.upstream.children[0].name, "main");
        assert_eq!(result.downstream.children[0].name, "leaf");
        assert!(!result.truncated);
        assert!(result.tree.contains("UPSTREAM:"));
        assert!(result.tree.contains("DOWNSTREAM:"));
        assert!(result.tree.contains("PRECISION: low (regex Python)"));
    }

    #[test]
    fn cyclic_relations_terminate() {
        let db = db_with_graph();
        db.upsert_symbols(&[
            symbol("root-1/app/main.py", "ping", 1),
            symbol("root-1/app/main.py", "pong", 10),
        ])
        .unwrap();
        db.upsert_relations(&[
            edge("root-1/app/main.py", "ping", "root-1/app/main.py", "pong", 2),
            edge("root-1/app/main.py", "pong", "root-1/app/main.py", "ping", 12),
        ])
        .unwrap();

        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "ping".to_string(),
                depth: 50,
                ..Default::default()
            })
            .unwrap();
        // Terminates, and stays well under any budget.
        assert!(result.meta.nodes < 10);
    }

    #[test]
    fn node_budget_truncates_with_reason() {
        let db = db_with_graph();
        let mut symbols = vec![symbol("root-1/app/main.py", "hub", 1)];
        let mut relations = Vec::new();
        for i in 0..30 {
            let callee = format!("callee_{i}");
            symbols.push(symbol("root-1/app/util.py", &callee, (i + 1) as i64));
            relations.push(edge(
                "root-1/app/main.py",
                "hub",
                "root-1/app/util.py",
                &callee,
                (i + 2) as i64,
            ));
        }
        db.upsert_symbols(&symbols).unwrap();
        db.upsert_relations(&relations).unwrap();

        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "hub".to_string(),
                depth: 2,
                max_nodes: 5,
                ..Default::default()
            })
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.truncate_reason, "node_budget_exceeded");
        assert!(result.meta.nodes <= 5);
        assert_eq!(result.graph_quality, "low");
    }

    #[test]
    fn high_fan_in_suppresses_confidence() {
        let db = db_with_graph();
        let mut symbols = vec![
            symbol("root-1/app/main.py", "main", 1),
            symbol("root-1/app/util.py", "log", 1),
        ];
        let mut relations =
            vec![edge("root-1/app/main.py", "main", "root-1/app/util.py", "log", 2)];
        // 60 other callers of `log`.
        for i in 0..60 {
            let caller = format!("caller_{i}");
            symbols.push(symbol("root-1/app/util.py", &caller, (i + 10) as i64));
            relations.push(edge(
                "root-1/app/util.py",
                &caller,
                "root-1/app/util.py",
                "log",
                (i + 11) as i64,
            ));
        }
        db.upsert_symbols(&symbols).unwrap();
        db.upsert_relations(&relations).unwrap();

        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "main".to_string(),
                depth: 1,
                ..Default::default()
            })
            .unwrap();
        let log_child = result
            .downstream
            .children
            .iter()
            .find(|c| c.name == "log")
            .expect("log child present");
        assert!(log_child.confidence <= 0.2);
    }

    #[test]
    fn fuzzy_fallback_kicks_in_and_is_recorded() {
        let db = db_with_graph();
        db.upsert_symbols(&[symbol("root-1/app/util.py", "handler", 1)])
            .unwrap();
        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "handlr".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.symbol, "handler");
        assert!(result.scope_reason.contains("fuzzy match for 'handler'"));
    }

    #[test]
    fn ambiguous_resolution_returns_candidates() {
        let db = db_with_graph();
        db.upsert_symbols(&[
            symbol("root-1/app/main.py", "dup", 1),
            symbol("root-1/app/util.py", "dup", 1),
        ])
        .unwrap();
        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "dup".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.matches.len(), 2);
        assert!(result.upstream.children.is_empty());
        assert!(result.downstream.children.is_empty());
    }

    #[test]
    fn exclude_paths_filter_children() {
        let db = db_with_graph();
        db.upsert_symbols(&[
            symbol("root-1/app/main.py", "main", 1),
            symbol("root-1/app/util.py", "helper", 1),
        ])
        .unwrap();
        db.upsert_relations(&[edge(
            "root-1/app/main.py",
            "main",
            "root-1/app/util.py",
            "helper",
            2,
        )])
        .unwrap();
        let service = CallGraphService::new(db);
        let result = service
            .build(&CallGraphRequest {
                symbol: "main".to_string(),
                depth: 1,
                exclude_paths: vec!["*util*".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert!(result.downstream.children.is_empty());
    }
}
