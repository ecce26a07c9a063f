// Call-graph plugins.
//
// Optional modules can augment or filter the neighbor set at each
// expansion step. Plugin failures are collected as warnings on the result
// payload, never fatal to the traversal.

use anyhow::Result;

use crate::database::relations::NeighborRow;

/// Where in the traversal a plugin is being consulted.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub symbol: String,
    pub path: String,
    /// "up" or "down".
    pub direction: String,
}

pub trait CallGraphPlugin: Send + Sync {
    /// Add synthetic neighbors (e.g. bridged edges from an external
    /// analyzer).
    fn augment_neighbors(&self, _ctx: &PluginContext, _neighbors: &mut Vec<NeighborRow>) -> Result<()> {
        Ok(())
    }

    /// Remove neighbors the plugin deems noise.
    fn filter_neighbors(&self, _ctx: &PluginContext, _neighbors: &mut Vec<NeighborRow>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::{CallGraphRequest, CallGraphService};
    use crate::database::SearchDatabase;
    use crate::database::types::{FileRecord, RelationRecord, SymbolRecord};
    use std::sync::Arc;

    struct FailingPlugin;

    impl CallGraphPlugin for FailingPlugin {
        fn augment_neighbors(
            &self,
            _ctx: &PluginContext,
            _neighbors: &mut Vec<NeighborRow>,
        ) -> Result<()> {
            anyhow::bail!("plugin exploded")
        }
    }

    struct DropAllPlugin;

    impl CallGraphPlugin for DropAllPlugin {
        fn filter_neighbors(
            &self,
            _ctx: &PluginContext,
            neighbors: &mut Vec<NeighborRow>,
        ) -> Result<()> {
            neighbors.clear();
            Ok(())
        }
    }

    fn seeded_db() -> Arc<SearchDatabase> {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        db.upsert_files(&[FileRecord {
            path: "root-1/m.py".to_string(),
            repo: "demo".to_string(),
            mtime: 1,
            size: 10,
            content: "x".to_string(),
            ..Default::default()
        }])
        .unwrap();
        db.upsert_symbols(&[
            SymbolRecord {
                path: "root-1/m.py".to_string(),
                name: "a".to_string(),
                qualname: "a".to_string(),
                kind: "function".to_string(),
                line: 1,
                end_line: 2,
                ..Default::default()
            },
            SymbolRecord {
                path: "root-1/m.py".to_string(),
                name: "b".to_string(),
                qualname: "b".to_string(),
                kind: "function".to_string(),
                line: 5,
                end_line: 6,
                ..Default::default()
            },
        ])
        .unwrap();
        db.upsert_relations(&[RelationRecord {
            from_path: "root-1/m.py".to_string(),
            from_symbol: "a".to_string(),
            to_path: "root-1/m.py".to_string(),
            to_symbol: "b".to_string(),
            rel_type: "calls".to_string(),
            line: 1,
            ..Default::default()
        }])
        .unwrap();
        db
    }

    #[test]
    fn plugin_errors_become_warnings_not_failures() {
        let service =
            CallGraphService::with_plugins(seeded_db(), vec![Arc::new(FailingPlugin)]);
        let result = service
            .build(&CallGraphRequest {
                symbol: "a".to_string(),
                depth: 1,
                ..Default::default()
            })
            .unwrap();
        assert!(!result.plugin_warnings.is_empty());
        // The traversal itself still ran.
        assert_eq!(result.summary.downstream_count, 1);
    }

    #[test]
    fn filter_plugin_prunes_neighbors() {
        let service =
            CallGraphService::with_plugins(seeded_db(), vec![Arc::new(DropAllPlugin)]);
        let result = service
            .build(&CallGraphRequest {
                symbol: "a".to_string(),
                depth: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.summary.downstream_count, 0);
    }
}
