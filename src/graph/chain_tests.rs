use serde_json::json;

use super::{
    NodeFilter, ReasoningChain, RelationshipKind, ThoughtKind, ThoughtNode, TraversalOrder,
};

fn node(id: &str, kind: ThoughtKind) -> ThoughtNode {
    ThoughtNode::new(kind, json!({"text": id}), "agent-1")
        .unwrap()
        .with_id(id)
}

/// root -> a -> c, root -> b -> c
fn diamond() -> ReasoningChain {
    let mut chain = ReasoningChain::new("diamond", "");
    chain
        .add_node(node("root", ThoughtKind::Observation), None, None)
        .unwrap();
    chain
        .add_node(
            node("a", ThoughtKind::Hypothesis),
            Some("root"),
            Some(RelationshipKind::DerivesFrom),
        )
        .unwrap();
    chain
        .add_node(
            node("b", ThoughtKind::Hypothesis),
            Some("root"),
            Some(RelationshipKind::DerivesFrom),
        )
        .unwrap();
    chain
        .add_node(
            node("c", ThoughtKind::Conclusion),
            Some("a"),
            Some(RelationshipKind::Supports),
        )
        .unwrap();
    chain
        .add_relationship("b", "c", RelationshipKind::Supports)
        .unwrap();
    chain
}

mod add_node_tests {
    use super::*;

    #[test]
    fn test_first_node_becomes_root_and_leaf() {
        let mut chain = ReasoningChain::new("test", "");
        let id = chain
            .add_node(node("n1", ThoughtKind::Observation), None, None)
            .unwrap();
        assert_eq!(id, "n1");
        assert!(chain.root_ids().contains("n1"));
        assert!(chain.leaf_ids().contains("n1"));
        let (ok, violations) = chain.validate();
        assert!(ok, "violations: {:?}", violations);
    }

    #[test]
    fn test_add_is_idempotent_on_existing_id() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("n1", ThoughtKind::Observation), None, None)
            .unwrap();
        let id = chain
            .add_node(node("n1", ThoughtKind::Conclusion), None, None)
            .unwrap();
        assert_eq!(id, "n1");
        assert_eq!(chain.len(), 1);
        // Original node untouched.
        assert_eq!(chain.get_node("n1").unwrap().kind, ThoughtKind::Observation);
    }

    #[test]
    fn test_parent_requires_relationship() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("n1", ThoughtKind::Observation), None, None)
            .unwrap();
        let err = chain
            .add_node(node("n2", ThoughtKind::Hypothesis), Some("n1"), None)
            .unwrap_err();
        assert!(err.to_string().contains("relationship required"));
        assert_eq!(chain.len(), 1, "failed add must not mutate");
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let mut chain = ReasoningChain::new("test", "");
        let result = chain.add_node(
            node("n1", ThoughtKind::Observation),
            Some("ghost"),
            Some(RelationshipKind::Supports),
        );
        assert!(result.is_err());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_attaching_child_updates_leaf_set() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("n1", ThoughtKind::Observation), None, None)
            .unwrap();
        chain
            .add_node(
                node("n2", ThoughtKind::Hypothesis),
                Some("n1"),
                Some(RelationshipKind::DerivesFrom),
            )
            .unwrap();

        assert!(!chain.leaf_ids().contains("n1"));
        assert!(chain.leaf_ids().contains("n2"));
        assert!(chain.root_ids().contains("n1"));
        assert!(!chain.root_ids().contains("n2"));
        assert_eq!(
            chain.get_node("n1").unwrap().relationship_to("n2"),
            Some(RelationshipKind::DerivesFrom)
        );
        assert_eq!(
            chain.get_node("n2").unwrap().relationship_to("n1"),
            Some(RelationshipKind::DerivesFrom)
        );
    }
}

mod remove_node_tests {
    use super::*;

    #[test]
    fn test_remove_absent_returns_false() {
        let mut chain = ReasoningChain::new("test", "");
        assert!(!chain.remove_node("ghost", false));
    }

    #[test]
    fn test_reconnect_orphans_carries_original_relationship() {
        // p1 -> mid -> c1, p2 -> mid
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("p1", ThoughtKind::Observation), None, None)
            .unwrap();
        chain
            .add_node(node("p2", ThoughtKind::Observation), None, None)
            .unwrap();
        chain
            .add_node(
                node("mid", ThoughtKind::Inference),
                Some("p1"),
                Some(RelationshipKind::DerivesFrom),
            )
            .unwrap();
        chain
            .add_relationship("p2", "mid", RelationshipKind::Extends)
            .unwrap();
        chain
            .add_node(
                node("c1", ThoughtKind::Conclusion),
                Some("mid"),
                Some(RelationshipKind::Supports),
            )
            .unwrap();

        assert!(chain.remove_node("mid", true));

        let c1 = chain.get_node("c1").unwrap();
        assert!(c1.parent_ids.contains("p1"));
        assert!(c1.parent_ids.contains("p2"));
        // The child is rewired with the removed node's relationship to each
        // former parent, not with its own former relationship.
        assert_eq!(c1.relationship_to("p1"), Some(RelationshipKind::DerivesFrom));
        assert_eq!(c1.relationship_to("p2"), Some(RelationshipKind::Extends));

        let (ok, violations) = chain.validate();
        assert!(ok, "violations: {:?}", violations);
    }

    #[test]
    fn test_without_reconnect_children_become_roots() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("p", ThoughtKind::Observation), None, None)
            .unwrap();
        chain
            .add_node(
                node("mid", ThoughtKind::Inference),
                Some("p"),
                Some(RelationshipKind::DerivesFrom),
            )
            .unwrap();
        chain
            .add_node(
                node("c", ThoughtKind::Conclusion),
                Some("mid"),
                Some(RelationshipKind::Supports),
            )
            .unwrap();

        assert!(chain.remove_node("mid", false));

        assert!(chain.root_ids().contains("c"));
        assert!(chain.leaf_ids().contains("p"), "parent lost its last child");
        let (ok, violations) = chain.validate();
        assert!(ok, "violations: {:?}", violations);
    }
}

mod relationship_tests {
    use super::*;

    #[test]
    fn test_missing_endpoint_fails_silently() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("n1", ThoughtKind::Observation), None, None)
            .unwrap();
        assert_eq!(
            chain
                .add_relationship("n1", "ghost", RelationshipKind::Supports)
                .unwrap(),
            false
        );
    }

    #[test]
    fn test_cycle_rejected_and_chain_unchanged() {
        let mut chain = diamond();
        let before = chain.get_node("c").unwrap().clone();

        let err = chain
            .add_relationship("c", "root", RelationshipKind::Supports)
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(chain.get_node("c").unwrap(), &before);
        let (ok, violations) = chain.validate();
        assert!(ok, "violations: {:?}", violations);
    }

    #[test]
    fn test_parallel_back_edge_is_exempt() {
        let mut chain = diamond();
        assert!(chain
            .add_relationship("c", "root", RelationshipKind::Parallel)
            .unwrap());
        let (ok, violations) = chain.validate();
        assert!(ok, "violations: {:?}", violations);
    }

    #[test]
    fn test_remove_relationship_restores_root_and_leaf() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(node("a", ThoughtKind::Observation), None, None)
            .unwrap();
        chain
            .add_node(
                node("b", ThoughtKind::Hypothesis),
                Some("a"),
                Some(RelationshipKind::DerivesFrom),
            )
            .unwrap();

        assert!(chain.remove_relationship("a", "b"));
        assert!(chain.root_ids().contains("b"));
        assert!(chain.leaf_ids().contains("a"));
        assert!(!chain.remove_relationship("a", "b"), "already removed");
        let (ok, violations) = chain.validate();
        assert!(ok, "violations: {:?}", violations);
    }
}

mod traversal_tests {
    use super::*;

    #[test]
    fn test_depth_first_visits_each_reachable_node_once() {
        let chain = diamond();
        let visited = chain
            .traverse(TraversalOrder::DepthFirst, None, None)
            .unwrap();
        let mut ids: Vec<&str> = visited.iter().map(|n| n.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b", "c", "root"]);
    }

    #[test]
    fn test_breadth_first_emits_parent_before_child() {
        let chain = diamond();
        let visited = chain
            .traverse(TraversalOrder::BreadthFirst, None, None)
            .unwrap();
        let ids: Vec<&str> = visited.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        let pos = |id: &str| ids.iter().position(|x| *x == id).unwrap();
        assert!(pos("root") < pos("a"));
        assert!(pos("root") < pos("b"));
        assert!(pos("a") < pos("c") || pos("b") < pos("c"));
    }

    #[test]
    fn test_traversal_from_start_node() {
        let chain = diamond();
        let visited = chain
            .traverse(TraversalOrder::DepthFirst, Some("a"), None)
            .unwrap();
        let ids: Vec<&str> = visited.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_unknown_start_is_invalid_argument() {
        let chain = diamond();
        assert!(chain
            .traverse(TraversalOrder::DepthFirst, Some("ghost"), None)
            .is_err());
    }

    #[test]
    fn test_filter_suppresses_without_halting() {
        let chain = diamond();
        let only_conclusions = |n: &ThoughtNode| n.kind == ThoughtKind::Conclusion;
        let visited = chain
            .traverse(TraversalOrder::DepthFirst, None, Some(&only_conclusions))
            .unwrap();
        let ids: Vec<&str> = visited.iter().map(|n| n.id.as_str()).collect();
        // The conclusion sits below filtered-out nodes and must still appear.
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn test_chronological_orders_ignore_edges() {
        let chain = diamond();
        let forward = chain
            .traverse(TraversalOrder::Chronological, None, None)
            .unwrap();
        let backward = chain
            .traverse(TraversalOrder::ReverseChronological, None, None)
            .unwrap();
        assert_eq!(forward.len(), 4);
        let f: Vec<&str> = forward.iter().map(|n| n.id.as_str()).collect();
        let mut b: Vec<&str> = backward.iter().map(|n| n.id.as_str()).collect();
        b.reverse();
        assert_eq!(f, b);
        for pair in forward.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn test_confidence_order_excludes_unscored_nodes() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(
                node("low", ThoughtKind::Hypothesis).with_confidence(0.2).unwrap(),
                None,
                None,
            )
            .unwrap();
        chain
            .add_node(
                node("high", ThoughtKind::Hypothesis).with_confidence(0.9).unwrap(),
                None,
                None,
            )
            .unwrap();
        chain
            .add_node(node("unscored", ThoughtKind::Question), None, None)
            .unwrap();

        let visited = chain
            .traverse(TraversalOrder::Confidence, None, None)
            .unwrap();
        let ids: Vec<&str> = visited.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }
}

mod query_tests {
    use super::*;

    #[test]
    fn test_find_nodes_filters_are_conjunctive() {
        let mut chain = ReasoningChain::new("test", "");
        chain
            .add_node(
                ThoughtNode::new(
                    ThoughtKind::Evidence,
                    json!({"finding": "latency spike"}),
                    "agent-a",
                )
                .unwrap()
                .with_id("e1")
                .with_confidence(0.9)
                .unwrap(),
                None,
                None,
            )
            .unwrap();
        chain
            .add_node(
                ThoughtNode::new(
                    ThoughtKind::Evidence,
                    json!({"finding": "latency spike"}),
                    "agent-b",
                )
                .unwrap()
                .with_id("e2")
                .with_confidence(0.3)
                .unwrap(),
                None,
                None,
            )
            .unwrap();

        let filter = NodeFilter::new()
            .with_kind(ThoughtKind::Evidence)
            .with_author("agent-a")
            .with_min_confidence(0.5)
            .with_keyword("LATENCY");
        let found = chain.find_nodes(&filter);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "e1");
    }

    #[test]
    fn test_find_paths_in_diamond() {
        let chain = diamond();
        let mut paths = chain.find_paths("root", "c").unwrap();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                vec!["root".to_string(), "a".to_string(), "c".to_string()],
                vec!["root".to_string(), "b".to_string(), "c".to_string()],
            ]
        );
        assert!(chain.find_paths("a", "b").unwrap().is_empty());
        assert!(chain.find_paths("root", "ghost").is_err());
    }

    #[test]
    fn test_find_paths_source_equals_target() {
        let chain = diamond();
        assert_eq!(
            chain.find_paths("a", "a").unwrap(),
            vec![vec!["a".to_string()]]
        );
    }
}

mod merge_tests {
    use super::*;

    fn single_node_chain(name: &str, node_id: &str) -> ReasoningChain {
        let mut chain = ReasoningChain::new(name, "");
        chain
            .add_node(node(node_id, ThoughtKind::Observation), None, None)
            .unwrap();
        chain
    }

    #[test]
    fn test_connect_roots_requires_relationship() {
        let mut a = single_node_chain("a", "na");
        let b = single_node_chain("b", "nb");
        assert!(a.merge(&b, true, None).is_err());
        assert_eq!(a.len(), 1, "failed merge must not mutate");
    }

    #[test]
    fn test_merge_copies_absent_nodes_and_connects_leaves_to_roots() {
        let mut a = single_node_chain("a", "na");
        let b = single_node_chain("b", "nb");

        let copied = a
            .merge(&b, true, Some(RelationshipKind::Supports))
            .unwrap();
        assert_eq!(copied, 1);
        assert_eq!(a.len(), 2);
        assert!(a.get_node("na").unwrap().child_ids.contains("nb"));
        assert_eq!(
            a.get_node("na").unwrap().relationship_to("nb"),
            Some(RelationshipKind::Supports)
        );
        let (ok, violations) = a.validate();
        assert!(ok, "violations: {:?}", violations);
    }

    #[test]
    fn test_merge_reestablishes_internal_relationships() {
        let mut target = single_node_chain("target", "t1");
        let source = diamond();

        let copied = target.merge(&source, false, None).unwrap();
        assert_eq!(copied, 4);
        assert_eq!(target.len(), 5);
        assert_eq!(
            target.get_node("root").unwrap().relationship_to("a"),
            Some(RelationshipKind::DerivesFrom)
        );
        assert_eq!(
            target.get_node("b").unwrap().relationship_to("c"),
            Some(RelationshipKind::Supports)
        );
        // Without connect_roots the merged roots stay roots.
        assert!(target.root_ids().contains("root"));
        assert!(target.root_ids().contains("t1"));
        let (ok, violations) = target.validate();
        assert!(ok, "violations: {:?}", violations);
    }

    #[test]
    fn test_merge_skips_nodes_already_present() {
        let mut a = diamond();
        let b = diamond();
        let copied = a.merge(&b, false, None).unwrap();
        assert_eq!(copied, 0);
        assert_eq!(a.len(), 4);
    }
}

mod model_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_model_round_trip_is_idempotent() {
        let mut chain = diamond();
        chain
            .update_thought_confidence("c", Some(0.75))
            .unwrap();

        let model = chain.to_model();
        let rebuilt = ReasoningChain::from_model(model.clone()).unwrap();
        assert_eq!(rebuilt.to_model(), model);

        let (ok, violations) = rebuilt.validate();
        assert!(ok, "violations: {:?}", violations);
        assert_eq!(rebuilt.len(), chain.len());
        assert_eq!(rebuilt.root_ids(), chain.root_ids());
        assert_eq!(rebuilt.leaf_ids(), chain.leaf_ids());
    }

    #[test]
    fn test_model_json_uses_wire_field_names() {
        let chain = diamond();
        let value = serde_json::to_value(chain.to_model()).unwrap();
        assert_eq!(value["chain_id"], chain.id);
        let node = &value["nodes"]["root"];
        assert_eq!(node["thought_type"], "observation");
        assert_eq!(node["author_agent_id"], "agent-1");
        assert!(node["timestamp"].is_number());
        assert_eq!(value["root_node_ids"][0], "root");
    }

    #[test]
    fn test_from_model_rejects_mismatched_node_key() {
        let chain = diamond();
        let mut model = chain.to_model();
        let entry = model.nodes.remove("root").unwrap();
        model.nodes.insert("renamed".to_string(), entry);
        assert!(ReasoningChain::from_model(model).is_err());
    }
}
