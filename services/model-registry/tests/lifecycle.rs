mod common;

use common::{build_test_context, ctx, register_request};
use model_registry::deployment::{DeploymentStatus, HistoryQuery, StatusUpdate, TriggerRequest, HISTORY_TABLE};
use model_registry::model::{ModelStatus, Visibility};
use model_registry::store::Scan;
use model_registry::RegistryError;

#[tokio::test]
async fn fraud_model_end_to_end() {
    let t = build_test_context();
    let fraud = ctx("fraud", &["models:read", "models:write", "models:deploy"]);
    let versions = &t.services.state.versions;
    let deployments = &t.services.state.deployments;

    let v = versions.register(&fraud, register_request("fraud-model", "1.0.0")).await.unwrap();
    assert_eq!(v.status, ModelStatus::Registered);

    let receipt = deployments.trigger_deployment(&fraud, "fraud-model", "1.0.0", TriggerRequest::default()).await.unwrap();
    assert_eq!(versions.get_version(&fraud, "fraud-model", "1.0.0").await.unwrap().status, ModelStatus::Deploying);

    deployments.update_deployment_status(&fraud, &receipt.deployment_id, StatusUpdate::new(DeploymentStatus::Deployed)).await.unwrap();
    assert_eq!(versions.get_version(&fraud, "fraud-model", "1.0.0").await.unwrap().status, ModelStatus::Deployed);

    let history = deployments.get_history(&fraud, HistoryQuery { deployment_id: Some(receipt.deployment_id.clone()), ..Default::default() }).await.unwrap();
    assert_eq!(history.iter().map(|e| e.status).collect::<Vec<_>>(), vec![DeploymentStatus::Initiated, DeploymentStatus::Deployed]);

    let by_version = deployments.get_history(&fraud, HistoryQuery { model_id: Some("fraud-model".into()), version: Some("1.0.0".into()), ..Default::default() }).await.unwrap();
    assert_eq!(by_version, history);

    let events = t.bus.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.payload["artifactUri"], "s3://models/fraud-model/1.0.0/model.pt");
}

#[tokio::test]
async fn history_entries_never_change_after_later_appends() {
    let t = build_test_context();
    let fraud = ctx("fraud", &["models:write", "models:deploy"]);
    t.services.state.versions.register(&fraud, register_request("churn", "2.1.0")).await.unwrap();
    let id = t.services.state.deployments.trigger_deployment(&fraud, "churn", "2.1.0", TriggerRequest::default()).await.unwrap().deployment_id;
    let prefix = format!("{id}#");

    let mut previous = t.store.scan(HISTORY_TABLE, Scan::prefix(&prefix)).await.unwrap();
    for status in [DeploymentStatus::InProgress, DeploymentStatus::Deploying, DeploymentStatus::Deploying, DeploymentStatus::RolledBack] {
        t.services.state.deployments.update_deployment_status(&fraud, &id, StatusUpdate::new(status)).await.unwrap();
        let current = t.store.scan(HISTORY_TABLE, Scan::prefix(&prefix)).await.unwrap();
        assert_eq!(current.len(), previous.len() + 1);
        assert_eq!(&current[..previous.len()], &previous[..]);
        previous = current;
    }
    let v = t.services.state.versions.get_version(&ctx("fraud", &["models:read"]), "churn", "2.1.0").await.unwrap();
    assert_eq!(v.status, ModelStatus::Registered);
}

#[tokio::test]
async fn racing_updates_on_one_deployment_do_not_both_land() {
    let t = build_test_context();
    let fraud = ctx("fraud", &["models:write", "models:deploy"]);
    t.services.state.versions.register(&fraud, register_request("ranker", "1.0.0")).await.unwrap();
    let deployments = t.services.state.deployments.clone();
    let id = deployments.trigger_deployment(&fraud, "ranker", "1.0.0", TriggerRequest::default()).await.unwrap().deployment_id;

    let mut handles = Vec::new();
    for status in [DeploymentStatus::Deployed, DeploymentStatus::Failed, DeploymentStatus::Deployed, DeploymentStatus::Failed] {
        let (svc, c, id) = (deployments.clone(), fraud.clone(), id.clone());
        handles.push(tokio::spawn(async move { svc.update_deployment_status(&c, &id, StatusUpdate::new(status)).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(RegistryError::Conflict(_)) | Err(RegistryError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    let history = deployments.get_history(&fraud, HistoryQuery { deployment_id: Some(id), ..Default::default() }).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn listings_never_leak_foreign_team_versions() {
    let t = build_test_context();
    let versions = &t.services.state.versions;
    let fraud = ctx("fraud", &["models:read", "models:write"]);
    let risk = ctx("risk", &["models:read", "models:write"]);

    versions.register(&fraud, register_request("scorer", "1.0.0")).await.unwrap();
    let mut shared = register_request("scorer", "1.1.0");
    shared.visibility = Visibility::Shared;
    versions.register(&fraud, shared).await.unwrap();
    assert!(matches!(versions.register(&risk, register_request("scorer", "1.0.0")).await, Err(RegistryError::Duplicate(_))));

    let seen = versions.list_versions(&risk, "scorer").await.unwrap();
    assert_eq!(seen.iter().map(|v| v.version.as_str()).collect::<Vec<_>>(), vec!["1.1.0"]);
    assert!(seen.iter().all(|v| v.team == "risk" || v.visibility == Visibility::Shared));
    assert_eq!(versions.get_latest(&risk, "scorer").await.unwrap().version, "1.1.0");
    assert_eq!(versions.list_versions(&ctx("ops", &["admin"]), "scorer").await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_deployment_update_is_not_found() {
    let t = build_test_context();
    let err = t.services.state.deployments
        .update_deployment_status(&ctx("fraud", &["models:deploy"]), "missing-1.0.0-0-abc", StatusUpdate::new(DeploymentStatus::Deployed))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}
