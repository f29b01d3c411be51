//! Unit tests for the prediction service.

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use super::*;
use crate::auth::AdminAllowList;
use crate::config::AuthConfig;
use crate::error::GraphError;
use crate::graph::{MockGenealogyGraph, ParentChildKind, Person, SqliteGraph};
use crate::rules::{DetectionRule, PredictionCandidate, RuleResult};
use crate::storage::SqliteStorage;

const ADMIN: &str = "admin";

struct FixedRule {
    id: &'static str,
    candidates: Vec<PredictionCandidate>,
}

#[async_trait]
impl DetectionRule for FixedRule {
    fn id(&self) -> &'static str {
        self.id
    }

    async fn detect(&self, _tree_id: &str) -> RuleResult<Vec<PredictionCandidate>> {
        Ok(self.candidates.clone())
    }
}

struct FailingRule;

#[async_trait]
impl DetectionRule for FailingRule {
    fn id(&self) -> &'static str {
        "broken"
    }

    async fn detect(&self, _tree_id: &str) -> RuleResult<Vec<PredictionCandidate>> {
        Err(GraphError::Query {
            message: "connection reset".to_string(),
        }
        .into())
    }
}

struct PanickingRule;

#[async_trait]
impl DetectionRule for PanickingRule {
    fn id(&self) -> &'static str {
        "panics"
    }

    async fn detect(&self, _tree_id: &str) -> RuleResult<Vec<PredictionCandidate>> {
        panic!("index out of bounds in rule");
    }
}

fn fixed(id: &'static str, candidates: Vec<PredictionCandidate>) -> Arc<dyn DetectionRule> {
    Arc::new(FixedRule { id, candidates })
}

fn gate() -> Arc<dyn AuthorizationGate> {
    Arc::new(AdminAllowList::new(&AuthConfig::from_list(ADMIN)))
}

fn admin() -> Caller {
    Caller::new(ADMIN)
}

fn service(
    store: Arc<SqliteStorage>,
    graph: Arc<dyn GenealogyGraph>,
    rules: RuleRegistry,
) -> PredictionService {
    PredictionService::new(store, graph, gate(), rules, ScanConfig::default())
}

async fn sqlite_fixture() -> (Arc<SqliteStorage>, SqliteGraph, String) {
    let storage = SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage");
    let graph = SqliteGraph::new(storage.pool().clone());
    let tree = graph.create_tree("Test tree").await.unwrap();
    (Arc::new(storage), graph, tree.id)
}

async fn stored_prediction(store: &SqliteStorage, tree_id: &str, confidence: f64) -> PredictedRelationship {
    let candidate = PredictionCandidate::parent_child(
        "spouse_child_gap",
        &format!("parent-{}", confidence),
        "child",
        confidence,
        "partner of a recorded parent",
    );
    let prediction = PredictedRelationship::from_candidate(tree_id, "batch-0", &candidate);
    store.insert_prediction(&prediction).await.unwrap();
    prediction
}

/// Seed a person under a readable id.
async fn seed_person(graph: &SqliteGraph, tree_id: &str, id: &str) {
    let mut person = Person::new(tree_id, id);
    person.id = id.to_string();
    graph.insert_person(&person).await.unwrap();
}

async fn execute(store: &SqliteStorage, sql: &str) {
    sqlx::query(sql).execute(store.pool()).await.unwrap();
}

async fn new_predictions(store: &SqliteStorage, tree_id: &str) -> Vec<PredictedRelationship> {
    let filter = PredictionFilter {
        status: Some(PredictionStatus::New),
        ..Default::default()
    };
    store
        .query_predictions(tree_id, &filter, 100, 0)
        .await
        .unwrap()
        .0
}

fn two_candidate_rules() -> RuleRegistry {
    let mut rules = RuleRegistry::new();
    rules
        .register(fixed(
            "fixed",
            vec![
                PredictionCandidate::parent_child("fixed", "a", "b", 90.0, "first"),
                PredictionCandidate::parent_child("fixed", "c", "d", 60.0, "second"),
            ],
        ))
        .unwrap();
    rules
}

// ============================================================================
// scan_tree
// ============================================================================

#[tokio::test]
async fn test_scan_requires_admin() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let err = service
        .scan_tree(&tree_id, &Caller::new("mallory"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
}

#[tokio::test]
async fn test_scan_unknown_tree_is_not_found() {
    let (store, graph, _) = sqlite_fixture().await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let err = service.scan_tree("no-such-tree", &admin()).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_failing_rules_are_isolated() {
    let (store, graph, tree_id) = sqlite_fixture().await;

    let mut rules = RuleRegistry::new();
    rules
        .register(fixed(
            "first",
            vec![PredictionCandidate::parent_child("first", "a", "b", 90.0, "first rule")],
        ))
        .unwrap();
    rules.register(Arc::new(FailingRule)).unwrap();
    rules.register(Arc::new(PanickingRule)).unwrap();
    rules
        .register(fixed(
            "last",
            vec![PredictionCandidate::union("last", "d", "c", 50.0, "last rule")],
        ))
        .unwrap();

    let service = service(store, Arc::new(graph), rules);
    let summary = service.scan_tree(&tree_id, &admin()).await.unwrap();

    assert_eq!(summary.failed_rules, vec!["broken", "panics"]);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.high_count, 1);
    assert_eq!(summary.medium_count, 0);
    assert_eq!(summary.low_count, 1);
    let rule_ids: Vec<&str> = summary.predictions.iter().map(|p| p.rule_id.as_str()).collect();
    assert_eq!(rule_ids, vec!["first", "last"]);
    assert!(summary
        .predictions
        .iter()
        .all(|p| p.scan_batch_id == summary.batch_id));
}

#[tokio::test]
async fn test_scan_merges_rules_flagging_same_couple() {
    let (store, graph, tree_id) = sqlite_fixture().await;

    let mut rules = RuleRegistry::new();
    rules
        .register(fixed(
            "missing_union",
            vec![PredictionCandidate::union("missing_union", "x", "y", 60.0, "co-parents")],
        ))
        .unwrap();
    rules
        .register(fixed(
            "age_family",
            vec![PredictionCandidate::union("age_family", "y", "x", 40.0, "same parish")],
        ))
        .unwrap();

    let service = service(store, Arc::new(graph), rules);
    let summary = service.scan_tree(&tree_id, &admin()).await.unwrap();

    assert_eq!(summary.total, 1);
    let prediction = &summary.predictions[0];
    assert_eq!(prediction.confidence, 76.0);
    assert_eq!(prediction.confidence_level, ConfidenceLevel::Medium);
    assert_eq!(prediction.rule_id, "missing_union");
    assert_eq!(
        prediction.explanation,
        "co-parents (also matched by: age_family)"
    );
}

#[tokio::test]
async fn test_rule_failures_are_rule_execution_errors() {
    let (store, graph, tree_id) = sqlite_fixture().await;

    let mut rules = RuleRegistry::new();
    rules.register(fixed("ok", Vec::new())).unwrap();
    rules.register(Arc::new(FailingRule)).unwrap();
    rules.register(Arc::new(PanickingRule)).unwrap();
    let service = service(store, Arc::new(graph), rules);

    let outcomes = service.run_rules(&tree_id).await;

    assert!(!outcomes[0].is_failure());
    for (outcome, expected_rule, detail) in [
        (&outcomes[1], "broken", "connection reset"),
        (&outcomes[2], "panics", "did not complete"),
    ] {
        match &outcome.result {
            Err(PredictionError::RuleExecution { rule_id, message }) => {
                assert_eq!(rule_id, expected_rule);
                assert!(message.contains(detail), "{}", message);
            }
            other => panic!("expected a rule execution error, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_insert_conflict_during_scan_is_skipped() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    // Allow a single unresolved prediction per target so two candidates collide
    execute(
        &store,
        "CREATE UNIQUE INDEX one_new_per_target \
         ON predicted_relationships(tree_id, target_person_id) WHERE status = 'New'",
    )
    .await;

    let mut rules = RuleRegistry::new();
    rules
        .register(fixed(
            "fixed",
            vec![
                PredictionCandidate::parent_child("fixed", "a", "z", 90.0, "strong"),
                PredictionCandidate::parent_child("fixed", "b", "z", 70.0, "weaker"),
                PredictionCandidate::union("fixed", "c", "d", 50.0, "couple"),
            ],
        ))
        .unwrap();
    let service = service(store.clone(), Arc::new(graph), rules);

    let summary = service.scan_tree(&tree_id, &admin()).await.unwrap();

    let sources: Vec<&str> = summary
        .predictions
        .iter()
        .map(|p| p.source_person_id.as_str())
        .collect();
    assert_eq!(sources, vec!["a", "c"]);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.medium_count, 0);

    let stored = new_predictions(&store, &tree_id).await;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|p| p.source_person_id != "b"));
}

#[tokio::test]
async fn test_failed_rescan_keeps_previous_batch() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let service = service(store.clone(), Arc::new(graph), two_candidate_rules());

    let first = service.scan_tree(&tree_id, &admin()).await.unwrap();
    assert_eq!(first.total, 2);

    execute(
        &store,
        "CREATE TRIGGER fail_second_insert BEFORE INSERT ON predicted_relationships \
         WHEN NEW.source_person_id = 'c' BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .await;

    let err = service.scan_tree(&tree_id, &admin()).await.unwrap_err();
    assert_eq!(err.code(), "internal_error");

    let stored = new_predictions(&store, &tree_id).await;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|p| p.scan_batch_id == first.batch_id));
}

#[tokio::test]
async fn test_tree_locks_are_released() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let service = service(store, Arc::new(graph), two_candidate_rules());

    let (caller_a, caller_b) = (admin(), admin());
    let (a, b) = tokio::join!(
        service.scan_tree(&tree_id, &caller_a),
        service.scan_tree(&tree_id, &caller_b)
    );
    a.unwrap();
    let summary = b.unwrap();
    service
        .dismiss_prediction(&summary.predictions[0].id, None, &admin())
        .await;

    assert_eq!(service.tree_locks.len(), 0);
}

// ============================================================================
// get_predictions
// ============================================================================

#[tokio::test]
async fn test_get_predictions_paginates() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    for confidence in [10.0, 20.0, 30.0, 40.0, 50.0] {
        stored_prediction(&store, &tree_id, confidence).await;
    }
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let filter = PredictionFilter {
        page: Some(3),
        page_size: Some(2),
        ..Default::default()
    };
    let page = service
        .get_predictions(&tree_id, &filter, &admin())
        .await
        .unwrap();

    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.page, 3);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].confidence, 10.0);
}

#[tokio::test]
async fn test_get_predictions_clamps_page_size() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    stored_prediction(&store, &tree_id, 70.0).await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let filter = PredictionFilter {
        page: Some(0),
        page_size: Some(0),
        ..Default::default()
    };
    let page = service
        .get_predictions(&tree_id, &filter, &admin())
        .await
        .unwrap();
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 1);

    let filter = PredictionFilter {
        page_size: Some(100_000),
        ..Default::default()
    };
    let page = service
        .get_predictions(&tree_id, &filter, &admin())
        .await
        .unwrap();
    assert_eq!(page.page_size, ScanConfig::default().max_page_size);

    let page = service
        .get_predictions(&tree_id, &PredictionFilter::default(), &admin())
        .await
        .unwrap();
    assert_eq!(page.page_size, 50);
}

#[tokio::test]
async fn test_get_predictions_requires_admin() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let err = service
        .get_predictions(&tree_id, &PredictionFilter::default(), &Caller::new("guest"))
        .await
        .unwrap_err();
    assert!(matches!(err, PredictionError::Forbidden { .. }));
}

// ============================================================================
// accept / dismiss
// ============================================================================

#[tokio::test]
async fn test_accept_unknown_prediction() {
    let (store, graph, _) = sqlite_fixture().await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let result = service.accept_prediction("missing", &admin()).await;
    assert!(!result.success);
    assert_eq!(result.code, "not_found");
}

#[tokio::test]
async fn test_accept_requires_admin() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 90.0).await;
    let service = service(store.clone(), Arc::new(graph), RuleRegistry::new());

    let result = service
        .accept_prediction(&prediction.id, &Caller::new("guest"))
        .await;
    assert!(!result.success);
    assert_eq!(result.code, "forbidden");

    let stored = store.get_prediction(&prediction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PredictionStatus::New);
}

#[tokio::test]
async fn test_accept_graph_conflict_leaves_prediction_new() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 90.0).await;
    seed_person(&graph, &tree_id, "parent-90").await;
    seed_person(&graph, &tree_id, "child").await;
    graph
        .insert_parent_child(&tree_id, "parent-90", "child", ParentChildKind::Adopted)
        .await
        .unwrap();
    let service = service(store.clone(), Arc::new(graph.clone()), RuleRegistry::new());

    let result = service.accept_prediction(&prediction.id, &admin()).await;
    assert!(!result.success);
    assert_eq!(result.code, "persistence_conflict");
    assert!(result.message.contains("may already exist"));

    let stored = store.get_prediction(&prediction.id).await.unwrap().unwrap();
    assert_eq!(stored, prediction);
    assert_eq!(graph.parent_child_edges(&tree_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_accept_rolls_back_graph_write_when_update_fails() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 90.0).await;
    seed_person(&graph, &tree_id, "parent-90").await;
    seed_person(&graph, &tree_id, "child").await;
    let service = service(store.clone(), Arc::new(graph.clone()), RuleRegistry::new());

    execute(
        &store,
        "CREATE TRIGGER fail_resolution BEFORE UPDATE ON predicted_relationships \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
    )
    .await;

    let failed = service.accept_prediction(&prediction.id, &admin()).await;
    assert!(!failed.success);
    assert_eq!(failed.code, "internal_error");
    assert!(graph.parent_child_edges(&tree_id).await.unwrap().is_empty());
    assert_eq!(
        store.get_prediction(&prediction.id).await.unwrap().unwrap().status,
        PredictionStatus::New
    );

    execute(&store, "DROP TRIGGER fail_resolution").await;

    let retried = service.accept_prediction(&prediction.id, &admin()).await;
    assert!(retried.success, "{}", retried.message);
    let applied = retried.prediction.unwrap();

    let edges = graph.parent_child_edges(&tree_id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(applied.applied_entity_id.as_deref(), Some(edges[0].id.as_str()));
    let stored = store.get_prediction(&prediction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PredictionStatus::Applied);
    assert_eq!(stored.applied_entity_id, applied.applied_entity_id);
}

#[tokio::test]
async fn test_accept_missing_person_is_not_found() {
    let (store, _, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 90.0).await;

    let mut graph = MockGenealogyGraph::new();
    graph
        .expect_person_exists()
        .returning(|_, person_id| Ok(person_id != "child"));
    graph.expect_insert_parent_child().never();
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let result = service.accept_prediction(&prediction.id, &admin()).await;
    assert_eq!(result.code, "not_found");
    assert!(result.message.contains("child"));
}

#[tokio::test]
async fn test_accept_internal_failure_is_generic() {
    let (store, _, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 90.0).await;

    let mut graph = MockGenealogyGraph::new();
    graph.expect_person_exists().returning(|_, _| {
        Err(GraphError::Query {
            message: "disk I/O error at page 42".to_string(),
        })
    });
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let result = service.accept_prediction(&prediction.id, &admin()).await;
    assert!(!result.success);
    assert_eq!(result.code, "internal_error");
    assert!(!result.message.contains("page 42"));
}

#[tokio::test]
async fn test_dismiss_records_reason_once() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 40.0).await;
    let service = service(store.clone(), Arc::new(graph), RuleRegistry::new());

    let result = service
        .dismiss_prediction(&prediction.id, Some("  different family  ".to_string()), &admin())
        .await;
    assert!(result.success);
    let dismissed = result.prediction.unwrap();
    assert_eq!(dismissed.status, PredictionStatus::Dismissed);
    assert_eq!(dismissed.dismiss_reason.as_deref(), Some("different family"));
    assert_eq!(dismissed.resolved_by_user_id.as_deref(), Some(ADMIN));

    let before = store.get_prediction(&prediction.id).await.unwrap().unwrap();
    let again = service
        .dismiss_prediction(&prediction.id, Some("changed my mind".to_string()), &admin())
        .await;
    assert!(!again.success);
    assert_eq!(again.code, "invalid_state");

    let accept = service.accept_prediction(&prediction.id, &admin()).await;
    assert_eq!(accept.code, "invalid_state");

    let after = store.get_prediction(&prediction.id).await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_dismiss_blank_reason_is_none() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let prediction = stored_prediction(&store, &tree_id, 40.0).await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let result = service
        .dismiss_prediction(&prediction.id, Some("   ".to_string()), &admin())
        .await;
    assert!(result.success);
    assert!(result.prediction.unwrap().dismiss_reason.is_none());
}

// ============================================================================
// accept_all_high_confidence
// ============================================================================

#[tokio::test]
async fn test_bulk_accept_counts_failures() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let strong = stored_prediction(&store, &tree_id, 95.0).await;
    let weak = stored_prediction(&store, &tree_id, 86.0).await;
    let below = stored_prediction(&store, &tree_id, 70.0).await;
    for id in ["parent-95", "parent-86", "parent-70", "child"] {
        seed_person(&graph, &tree_id, id).await;
    }
    graph
        .insert_parent_child(&tree_id, "parent-86", "child", ParentChildKind::Biological)
        .await
        .unwrap();
    let service = service(store.clone(), Arc::new(graph), RuleRegistry::new());

    let summary = service
        .accept_all_high_confidence(&tree_id, None, &admin())
        .await
        .unwrap();
    assert_eq!(
        summary,
        BulkAcceptSummary {
            accepted: 1,
            failed: 1,
            considered: 2,
        }
    );

    let status = |p: Option<PredictedRelationship>| p.unwrap().status;
    assert_eq!(
        status(store.get_prediction(&strong.id).await.unwrap()),
        PredictionStatus::Applied
    );
    assert_eq!(
        status(store.get_prediction(&weak.id).await.unwrap()),
        PredictionStatus::New
    );
    assert_eq!(
        status(store.get_prediction(&below.id).await.unwrap()),
        PredictionStatus::New
    );
}

#[tokio::test]
async fn test_bulk_accept_requires_admin() {
    let (store, graph, tree_id) = sqlite_fixture().await;
    let service = service(store, Arc::new(graph), RuleRegistry::new());

    let err = service
        .accept_all_high_confidence(&tree_id, Some(50.0), &Caller::new("guest"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
}
