//! End-to-end scan and review scenarios against a real SQLite graph.

use std::sync::Arc;

use chrono::NaiveDate;
use genealogy_predictions::auth::{AdminAllowList, Caller};
use genealogy_predictions::config::{AuthConfig, RuleConfig, ScanConfig};
use genealogy_predictions::graph::{
    GenealogyGraph, ParentChildKind, Person, SqliteGraph, UnionKind,
};
use genealogy_predictions::rules::RuleRegistry;
use genealogy_predictions::storage::{
    AppliedEntityType, ConfidenceLevel, PredictedType, PredictionFilter, PredictionStatus,
    SqliteStorage,
};
use genealogy_predictions::PredictionService;
use pretty_assertions::assert_eq;

struct Fixture {
    service: PredictionService,
    graph: SqliteGraph,
    tree_id: String,
    admin: Caller,
}

impl Fixture {
    async fn new() -> Self {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let graph = SqliteGraph::new(storage.pool().clone());
        let shared_graph: Arc<dyn GenealogyGraph> = Arc::new(graph.clone());

        let service = PredictionService::new(
            Arc::new(storage),
            shared_graph.clone(),
            Arc::new(AdminAllowList::new(&AuthConfig::from_list("admin"))),
            RuleRegistry::with_default_rules(shared_graph, &RuleConfig::default()),
            ScanConfig::default(),
        );
        let tree = graph.create_tree("Lifecycle").await.unwrap();

        Self {
            service,
            graph,
            tree_id: tree.id,
            admin: Caller::new("admin"),
        }
    }

    async fn person(&self, name: &str) -> Person {
        let person = Person::new(&self.tree_id, name);
        self.graph.insert_person(&person).await.unwrap();
        person
    }

    async fn add_person(&self, person: Person) -> Person {
        self.graph.insert_person(&person).await.unwrap();
        person
    }

    async fn parent(&self, parent: &Person, child: &Person) {
        self.graph
            .insert_parent_child(&self.tree_id, &parent.id, &child.id, ParentChildKind::Biological)
            .await
            .unwrap();
    }

    async fn couple(&self, a: &Person, b: &Person) {
        self.graph
            .insert_union(&self.tree_id, &a.id, &b.id, UnionKind::Marriage)
            .await
            .unwrap();
    }

    /// A union where only the first partner is recorded as the child's parent.
    async fn spouse_gap_family(&self, prefix: &str) -> (Person, Person, Person) {
        let recorded = self.person(&format!("{} Anna", prefix)).await;
        let missing = self.person(&format!("{} Boris", prefix)).await;
        let child = self.person(&format!("{} Clara", prefix)).await;
        self.couple(&recorded, &missing).await;
        self.parent(&recorded, &child).await;
        (recorded, missing, child)
    }

    async fn list(&self, status: PredictionStatus) -> Vec<genealogy_predictions::storage::PredictedRelationship> {
        let filter = PredictionFilter {
            status: Some(status),
            ..Default::default()
        };
        self.service
            .get_predictions(&self.tree_id, &filter, &self.admin)
            .await
            .unwrap()
            .items
    }
}

fn born(year: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 1, 1).unwrap()
}

#[tokio::test]
async fn test_spouse_gap_scan_and_accept_writes_edge() {
    let fx = Fixture::new().await;
    let (_, missing, child) = fx.spouse_gap_family("F").await;

    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.high_count, 1);

    let prediction = &summary.predictions[0];
    assert_eq!(prediction.rule_id, "spouse_child_gap");
    assert_eq!(prediction.predicted_type, PredictedType::ParentChild);
    assert_eq!(prediction.source_person_id, missing.id);
    assert_eq!(prediction.target_person_id, child.id);
    assert_eq!(prediction.confidence, 90.0);
    assert_eq!(prediction.status, PredictionStatus::New);

    let result = fx.service.accept_prediction(&prediction.id, &fx.admin).await;
    assert!(result.success, "{}", result.message);
    let applied = result.prediction.unwrap();
    assert_eq!(applied.status, PredictionStatus::Applied);
    assert_eq!(applied.applied_entity_type, Some(AppliedEntityType::ParentChild));
    assert_eq!(applied.resolved_by_user_id.as_deref(), Some("admin"));

    let edges = fx.graph.parent_child_edges(&fx.tree_id).await.unwrap();
    let created = edges
        .iter()
        .find(|e| e.parent_id == missing.id && e.child_id == child.id)
        .expect("accepted edge");
    assert_eq!(applied.applied_entity_id.as_deref(), Some(created.id.as_str()));

    // The gap is closed; nothing left to propose
    let rescan = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    assert_eq!(rescan.total, 0);
}

#[tokio::test]
async fn test_missing_union_accept_creates_union_with_both_members() {
    let fx = Fixture::new().await;
    let mother = fx.person("Maria").await;
    let father = fx.person("Pavel").await;
    let child = fx.person("Olga").await;
    fx.parent(&mother, &child).await;
    fx.parent(&father, &child).await;

    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    assert_eq!(summary.total, 1);
    let prediction = &summary.predictions[0];
    assert_eq!(prediction.predicted_type, PredictedType::Union);
    assert_eq!(prediction.confidence, 60.0);
    assert_eq!(prediction.confidence_level, ConfidenceLevel::Medium);

    let result = fx.service.accept_prediction(&prediction.id, &fx.admin).await;
    assert!(result.success, "{}", result.message);
    assert_eq!(
        result.prediction.unwrap().applied_entity_type,
        Some(AppliedEntityType::Union)
    );

    let unions = fx.graph.unions(&fx.tree_id).await.unwrap();
    assert_eq!(unions.len(), 1);
    let mut partners = unions[0].partner_ids.clone();
    partners.sort();
    let mut expected = vec![mother.id.clone(), father.id.clone()];
    expected.sort();
    assert_eq!(partners, expected);
}

#[tokio::test]
async fn test_rescan_replaces_unresolved_predictions() {
    let fx = Fixture::new().await;
    fx.spouse_gap_family("F").await;

    let first = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    let second = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();

    assert_ne!(first.batch_id, second.batch_id);
    let keys = |s: &genealogy_predictions::service::ScanSummary| {
        s.predictions
            .iter()
            .map(|p| (p.key(), p.confidence))
            .collect::<Vec<_>>()
    };
    assert_eq!(keys(&first), keys(&second));

    let stored = fx.list(PredictionStatus::New).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].scan_batch_id, second.batch_id);
}

#[tokio::test]
async fn test_dismissed_pair_is_never_proposed_again() {
    let fx = Fixture::new().await;
    fx.spouse_gap_family("F").await;

    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    let id = summary.predictions[0].id.clone();

    let dismissed = fx
        .service
        .dismiss_prediction(&id, Some("stepchild".to_string()), &fx.admin)
        .await;
    assert!(dismissed.success);

    let rescan = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    assert_eq!(rescan.total, 0);
    assert!(fx.list(PredictionStatus::New).await.is_empty());

    let kept = fx.list(PredictionStatus::Dismissed).await;
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].id, id);
    assert_eq!(kept[0].dismiss_reason.as_deref(), Some("stepchild"));
}

#[tokio::test]
async fn test_agreeing_rules_merge_into_one_prediction() {
    let fx = Fixture::new().await;
    let a = fx
        .add_person(
            Person::new(&fx.tree_id, "Anton")
                .with_birth_date(born(1900))
                .with_tag("village:ostrov"),
        )
        .await;
    let b = fx
        .add_person(
            Person::new(&fx.tree_id, "Vera")
                .with_birth_date(born(1903))
                .with_tag("village:ostrov"),
        )
        .await;
    let child = fx.person("Yuri").await;
    fx.parent(&a, &child).await;
    fx.parent(&b, &child).await;

    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();

    assert_eq!(summary.total, 1);
    let merged = &summary.predictions[0];
    assert_eq!(merged.predicted_type, PredictedType::Union);
    assert_eq!(merged.rule_id, "missing_union");
    assert_eq!(merged.confidence, 76.0);
    assert_eq!(merged.confidence_level, ConfidenceLevel::Medium);
    assert!(merged.explanation.contains("also matched by: age_family"));
}

#[tokio::test]
async fn test_multiple_rules_in_one_scan_sorted_by_confidence() {
    let fx = Fixture::new().await;
    let p1 = fx.person("Ivan").await;
    let p2 = fx.person("Irina").await;
    let s1 = fx.person("Sasha").await;
    let s2 = fx.person("Misha").await;
    fx.parent(&p1, &s1).await;
    fx.parent(&p2, &s1).await;
    fx.parent(&p1, &s2).await;

    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();

    let found: Vec<(&str, f64)> = summary
        .predictions
        .iter()
        .map(|p| (p.rule_id.as_str(), p.confidence))
        .collect();
    assert_eq!(
        found,
        vec![("sibling_parent_gap", 70.0), ("missing_union", 60.0)]
    );
    assert_eq!(summary.predictions[0].source_person_id, p2.id);
    assert_eq!(summary.predictions[0].target_person_id, s2.id);
    assert_eq!(summary.medium_count, 2);
}

#[tokio::test]
async fn test_bulk_accept_respects_threshold() {
    let fx = Fixture::new().await;
    fx.spouse_gap_family("F1").await;
    fx.spouse_gap_family("F2").await;
    let m = fx.person("Marta").await;
    let p = fx.person("Petr").await;
    let c = fx.person("Nina").await;
    fx.parent(&m, &c).await;
    fx.parent(&p, &c).await;

    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.high_count, 2);

    let bulk = fx
        .service
        .accept_all_high_confidence(&fx.tree_id, None, &fx.admin)
        .await
        .unwrap();
    assert_eq!((bulk.accepted, bulk.failed, bulk.considered), (2, 0, 2));

    let remaining = fx.list(PredictionStatus::New).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].predicted_type, PredictedType::Union);

    let lowered = fx
        .service
        .accept_all_high_confidence(&fx.tree_id, Some(60.0), &fx.admin)
        .await
        .unwrap();
    assert_eq!(lowered.accepted, 1);
    assert_eq!(fx.list(PredictionStatus::Applied).await.len(), 3);
    assert_eq!(fx.graph.unions(&fx.tree_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_non_admin_cannot_review() {
    let fx = Fixture::new().await;
    fx.spouse_gap_family("F").await;
    let summary = fx.service.scan_tree(&fx.tree_id, &fx.admin).await.unwrap();
    let id = &summary.predictions[0].id;
    let outsider = Caller::new("visitor");

    let accept = fx.service.accept_prediction(id, &outsider).await;
    assert!(!accept.success);
    assert_eq!(accept.code, "forbidden");

    let dismiss = fx.service.dismiss_prediction(id, None, &outsider).await;
    assert_eq!(dismiss.code, "forbidden");

    assert_eq!(fx.list(PredictionStatus::New).await.len(), 1);
}
