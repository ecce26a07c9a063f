// ASCII tree rendering for call-graph results.

use super::{CallGraphResult, GraphNode, SortBy};

/// Render the two-direction tree with box-drawing branches, a SUMMARY
/// footer, and the PRECISION hint.
pub fn render_tree(result: &CallGraphResult, sort: SortBy) -> String {
    let mut lines: Vec<String> = Vec::new();

    let mut root_label = result.symbol.clone();
    if !result.path.is_empty() {
        root_label.push_str(&format!(" [{}]", result.path));
    }
    if !result.symbol_id.is_empty() {
        root_label.push_str(&format!(" (sid={})", result.symbol_id));
    }
    lines.push(root_label);

    lines.push("UPSTREAM:".to_string());
    emit(&result.upstream, "", sort, &mut lines);
    lines.push("DOWNSTREAM:".to_string());
    emit(&result.downstream, "", sort, &mut lines);

    if result.truncated {
        lines.push(format!("[truncated: {}]", result.truncate_reason));
    }
    lines.push(format!(
        "SUMMARY: upstream_nodes={} downstream_nodes={} nodes={} edges={} quality={}",
        result.summary.upstream_count,
        result.summary.downstream_count,
        result.meta.nodes,
        result.meta.edges,
        result.graph_quality,
    ));
    if !result.precision_hint.is_empty() {
        lines.push(format!("PRECISION: {}", result.precision_hint));
    }
    lines.join("\n")
}

fn sorted_children(node: &GraphNode, sort: SortBy) -> Vec<&GraphNode> {
    let mut children: Vec<&GraphNode> = node.children.iter().collect();
    match sort {
        SortBy::Line => children.sort_by(|a, b| a.line.cmp(&b.line).then(a.name.cmp(&b.name))),
        SortBy::Name => children.sort_by(|a, b| a.name.cmp(&b.name).then(a.line.cmp(&b.line))),
    }
    children
}

fn emit(node: &GraphNode, prefix: &str, sort: SortBy, lines: &mut Vec<String>) {
    let children = sorted_children(node, sort);
    let count = children.len();
    for (i, child) in children.into_iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└─ " } else { "├─ " };
        let mut label = child.name.clone();
        if !child.path.is_empty() {
            label.push_str(&format!(" [{}]", child.path));
        }
        if !child.symbol_id.is_empty() {
            label.push_str(&format!(" (sid={})", child.symbol_id));
        }
        if child.line > 0 {
            label.push_str(&format!(" :{}", child.line));
        }
        lines.push(format!("{prefix}{branch}{label}"));
        let child_prefix = format!("{prefix}{}", if last { "   " } else { "│  " });
        emit(child, &child_prefix, sort, lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::{GraphMeta, GraphSummary};

    fn node(name: &str, line: i64, children: Vec<GraphNode>) -> GraphNode {
        GraphNode {
            name: name.to_string(),
            path: format!("root-1/{name}.py"),
            line,
            children,
            ..Default::default()
        }
    }

    #[test]
    fn renders_branches_and_footers() {
        let result = CallGraphResult {
            symbol: "target".to_string(),
            path: "root-1/target.py".to_string(),
            upstream: GraphNode {
                children: vec![node("caller_b", 20, Vec::new()), node("caller_a", 5, Vec::new())],
                ..Default::default()
            },
            downstream: GraphNode {
                children: vec![node("callee", 3, vec![node("nested", 9, Vec::new())])],
                ..Default::default()
            },
            graph_quality: "med".to_string(),
            precision_hint: "low (regex Python)".to_string(),
            summary: GraphSummary {
                upstream_count: 2,
                downstream_count: 1,
            },
            meta: GraphMeta {
                nodes: 5,
                edges: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let tree = render_tree(&result, SortBy::Line);
        // Line sort puts caller_a (line 5) first.
        let a_pos = tree.find("caller_a").unwrap();
        let b_pos = tree.find("caller_b").unwrap();
        assert!(a_pos < b_pos);
        assert!(tree.contains("├─ ") || tree.contains("└─ "));
        assert!(tree.contains("│  └─ nested") || tree.contains("   └─ nested"));
        assert!(tree.contains("SUMMARY: upstream_nodes=2 downstream_nodes=1"));
        assert!(tree.contains("PRECISION: low (regex Python)"));
    }

    #[test]
    fn truncation_note_is_rendered() {
        let result = CallGraphResult {
            symbol: "t".to_string(),
            truncated: true,
            truncate_reason: "node_budget_exceeded".to_string(),
            ..Default::default()
        };
        let tree = render_tree(&result, SortBy::Name);
        assert!(tree.contains("[truncated: node_budget_exceeded]"));
    }
}
