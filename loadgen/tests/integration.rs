//! Integration Tests for the Towerload load generator
//!
//! These tests drive the request client, the identity flow and whole runs
//! over real HTTP against a scripted fake backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use towerload_loadgen::client::{
    ApiClient, CONNECTION_CODE, ClientSettings, IdentityProvider, Transport, device_id,
};
use towerload_loadgen::lifecycle::Pacer;
use towerload_loadgen::metrics::{self, Metrics, MetricsSink};
use towerload_loadgen::{Config, ReqwestTransport, RunError, RunSummary, Runner};

mod common;
use common::*;

fn transport() -> Arc<dyn Transport> {
    Arc::new(ReqwestTransport::new(Duration::from_secs(5), "towerload-tests").unwrap())
}

fn client(config: &Config, identity: Arc<dyn IdentityProvider>, metrics: Arc<Metrics>) -> ApiClient {
    let sink: Arc<dyn MetricsSink> = metrics;
    ApiClient::new(
        transport(),
        identity,
        sink,
        Pacer::immediate(),
        Arc::new(ClientSettings::from_config(config)),
        4,
    )
}

// ============================================================================
// Request client over HTTP
// ============================================================================

mod api_client {
    use super::*;

    #[tokio::test]
    async fn test_server_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let backend = spawn_backend(move |hit| {
            if hit.path == "users/stats" && seen.fetch_add(1, Ordering::SeqCst) < 2 {
                return (503, json!({}));
            }
            ok(json!({ "games": [] }))
        })
        .await;
        let metrics = Arc::new(Metrics::new());
        let mut api = client(
            &test_config(&backend.url),
            Arc::new(FakeIdentity::new()),
            metrics.clone(),
        );
        api.auth("+15550000004").await.unwrap();

        let result = api.get("users/stats").await;

        assert!(result.is_ok());
        assert_eq!(result.data().unwrap()["games"], json!([]));
        assert_eq!(backend.count("users/stats"), 3);
        assert_eq!(metrics.counter_total(metrics::NETWORK_ERRORS), 2);
        for hit in backend.hits_to("users/stats") {
            assert_eq!(hit.authorization.as_deref(), Some("Bearer token-+15550000004"));
            assert_eq!(hit.device_id.as_deref(), Some(device_id(4).as_str()));
        }
    }

    #[tokio::test]
    async fn test_expected_rejections_are_not_counted() {
        let backend = spawn_backend(|hit| match hit.path.as_str() {
            "users/session_start" => app_error(404, 1004, "User not found"),
            _ => app_error(400, 2000, "Bad request"),
        })
        .await;
        let metrics = Arc::new(Metrics::new());
        let mut api = client(
            &test_config(&backend.url),
            Arc::new(FakeIdentity::new()),
            metrics.clone(),
        );

        let missing = api.post("users/session_start", &json!({})).await;
        let rejected = api.get("users/stats").await;

        assert_eq!(missing.code(), Some(1004));
        assert!(!missing.is_fatal());
        assert_eq!(rejected.status(), Some(400));
        assert_eq!(backend.count("users/stats"), 1);
        assert_eq!(metrics.counter_total(metrics::API_ERRORS), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_a_handled_error() {
        let config = test_config(&unreachable_url().await);
        let metrics = Arc::new(Metrics::new());
        let mut api = client(&config, Arc::new(FakeIdentity::new()), metrics.clone());

        let result = api.get("users").await;

        assert!(result.is_err());
        assert!(!result.is_fatal());
        assert_eq!(result.status(), None);
        assert_eq!(result.code(), Some(CONNECTION_CODE));
        assert_eq!(
            metrics.counter_total(metrics::NETWORK_ERRORS),
            u64::from(config.retry.max_attempts)
        );
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refreshed() {
        let backend = spawn_backend(|_| ok(json!({}))).await;
        let identity = Arc::new(FakeIdentity {
            expires_in: Duration::from_secs(30),
            ..FakeIdentity::default()
        });
        let mut api = client(
            &test_config(&backend.url),
            identity.clone(),
            Arc::new(Metrics::new()),
        );
        api.auth("+15550000004").await.unwrap();
        assert!(api.needs_refresh());

        let result = api.get("users").await;

        assert!(result.is_ok());
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(identity.sign_ups.load(Ordering::SeqCst), 1);
    }
}

// ============================================================================
// Identity provider over HTTP
// ============================================================================

mod identity {
    use super::*;
    use towerload_loadgen::CognitoIdentity;

    #[tokio::test]
    async fn test_custom_auth_flow_tolerates_existing_user() {
        let backend = spawn_backend(|hit| match hit.target.as_deref() {
            Some("AWSCognitoIdentityProviderService.SignUp") => (
                400,
                json!({ "__type": "UsernameExistsException", "message": "User already exists" }),
            ),
            Some("AWSCognitoIdentityProviderService.InitiateAuth") => {
                (200, json!({ "ChallengeName": "CUSTOM_CHALLENGE", "Session": "s-1" }))
            }
            Some("AWSCognitoIdentityProviderService.RespondToAuthChallenge") => (
                200,
                json!({
                    "AuthenticationResult": {
                        "AccessToken": "abc",
                        "ExpiresIn": 3600,
                        "RefreshToken": "r-1",
                    }
                }),
            ),
            _ => ok(json!({})),
        })
        .await;
        let mut config = test_config(&backend.url);
        config.auth.endpoint = format!("{}cognito", backend.url);
        config.auth.client_id = "client-1".to_string();
        let identity = Arc::new(CognitoIdentity::new(transport(), &config.auth));
        let mut api = client(&config, identity, Arc::new(Metrics::new()));

        api.auth("+15550000004").await.unwrap();
        let result = api.get("users").await;

        assert!(result.is_ok());
        let targets: Vec<String> = backend
            .hits_to("cognito")
            .iter()
            .filter_map(|h| h.target.clone())
            .collect();
        assert_eq!(
            targets,
            [
                "AWSCognitoIdentityProviderService.SignUp",
                "AWSCognitoIdentityProviderService.InitiateAuth",
                "AWSCognitoIdentityProviderService.RespondToAuthChallenge",
            ]
        );
        let challenge = &backend.hits_to("cognito")[2];
        assert_eq!(challenge.body["Session"], "s-1");
        assert_eq!(challenge.body["ClientId"], "client-1");
        let users = &backend.hits_to("users")[0];
        assert_eq!(users.authorization.as_deref(), Some("Bearer abc"));
    }
}

// ============================================================================
// Whole runs
// ============================================================================

mod runs {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    async fn run(config: Config) -> (Result<RunSummary, RunError>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let runner = Runner::new(
            config,
            transport(),
            Arc::new(FakeIdentity::new()),
            metrics.clone(),
        )
        .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(20), runner.run())
            .await
            .expect("run did not finish");
        (result, metrics)
    }

    fn weights(entries: &[(&str, &[(&str, f64)])]) -> HashMap<String, HashMap<String, f64>> {
        entries
            .iter()
            .map(|(screen, actions)| {
                let actions = actions.iter().map(|(a, w)| (a.to_string(), *w)).collect();
                (screen.to_string(), actions)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_new_users_register_and_top_up() {
        let registered = Arc::new(Mutex::new(HashSet::new()));
        let backend = spawn_backend(move |hit| {
            let username = hit.username().unwrap_or_default().to_string();
            let mut registered = registered.lock().unwrap();
            match hit.path.as_str() {
                "users/session_start" if registered.contains(&username) => {
                    ok(user_payload(&username, true))
                }
                "users/session_start" => app_error(404, 1004, "User not found"),
                "users/register" => {
                    registered.insert(username.clone());
                    ok(user_payload(&username, false))
                }
                "users/activate" => ok(user_payload(&username, true)),
                _ => ok(json!(null)),
            }
        })
        .await;
        let mut config = test_config(&backend.url);
        // Every session: bootstrap, open and leave home, then exit the app
        config.action_weights = weights(&[
            (
                "session",
                &[
                    ("exit", 1.0),
                    ("activityScreen", 0.0),
                    ("goalsScreen", 0.0),
                    ("homeScreen", 0.0),
                ],
            ),
            (
                "homeScreen",
                &[
                    ("newTab", 1.0),
                    ("settings", 0.0),
                    ("walletDetails", 0.0),
                    ("playRandom", 0.0),
                    ("powerPlaySettings", 0.0),
                ],
            ),
        ]);

        let (result, metrics) = run(config).await;

        assert_eq!(
            result.unwrap(),
            RunSummary {
                finished: 2,
                aborted: 0,
                not_started: 0,
            }
        );
        assert_eq!(backend.count("users/register"), 2);
        assert_eq!(backend.count("users/activate"), 2);
        assert!(backend.count("users/session_start") >= 2);
        assert!(backend.count("users/set_xp") >= 2);
        assert!(backend.count("config/towerdata") >= 2);
        assert!(metrics.counter_total(metrics::SESSIONS) >= 2);
        assert!(metrics.counter_total(metrics::HOME_SCREEN) >= 2);
        assert_eq!(metrics.counter_total(metrics::API_ERRORS), 0);
        let top_up = &backend.hits_to("users/set_balance")[0];
        assert_eq!(top_up.body["amount"], json!(500.0));
    }

    #[tokio::test]
    async fn test_rejected_startup_stops_each_vu() {
        let backend = spawn_backend(|hit| match hit.path.as_str() {
            "startup" => app_error(403, 3001, "Maintenance"),
            _ => ok(json!({})),
        })
        .await;

        let (result, _) = run(test_config(&backend.url)).await;

        assert_eq!(
            result.unwrap(),
            RunSummary {
                finished: 2,
                aborted: 0,
                not_started: 0,
            }
        );
        assert_eq!(backend.count("startup"), 2);
        assert_eq!(backend.count("users/session_start"), 0);
    }

    #[tokio::test]
    async fn test_vus_recover_from_server_errors_at_startup() {
        // Two startup calls exhaust their retries before the backend recovers
        let outage = 2 * Config::default().retry.max_attempts as usize;
        let startups = Arc::new(AtomicUsize::new(0));
        let seen = startups.clone();
        let backend = spawn_backend(move |hit| {
            let username = hit.username().unwrap_or_default().to_string();
            match hit.path.as_str() {
                "startup" if seen.fetch_add(1, Ordering::SeqCst) < outage => {
                    (503, json!({}))
                }
                "users/session_start" => ok(user_payload(&username, true)),
                _ => ok(json!(null)),
            }
        })
        .await;
        let mut config = test_config(&backend.url);
        config.action_weights = weights(&[(
            "session",
            &[
                ("exit", 1.0),
                ("activityScreen", 0.0),
                ("goalsScreen", 0.0),
                ("homeScreen", 0.0),
            ],
        )]);

        let (result, metrics) = run(config).await;

        assert_eq!(
            result.unwrap(),
            RunSummary {
                finished: 2,
                aborted: 0,
                not_started: 0,
            }
        );
        assert!(startups.load(Ordering::SeqCst) > outage);
        assert!(backend.count("users/session_start") >= 1);
        assert!(metrics.counter_total(metrics::SESSIONS) >= 1);
        assert_eq!(metrics.counter_total(metrics::NETWORK_ERRORS), outage as u64);
        assert_eq!(metrics.counter_total(metrics::API_ERRORS), 0);
    }

    #[tokio::test]
    async fn test_first_task_marks_setup_done() {
        let backend = spawn_backend(|hit| match hit.path.as_str() {
            "startup" => app_error(403, 3001, "Maintenance"),
            _ => ok(json!({})),
        })
        .await;
        let mut config = test_config(&backend.url);
        config.test_id = Some("t-1".to_string());

        let (result, _) = run(config).await;

        assert!(result.is_ok());
        let hits = backend.hits();
        assert_eq!(hits[0].path, "testing/flags");
        assert_eq!(hits[0].body, json!({ "testId": "t-1", "key": "setup", "value": false }));
        assert_eq!(hits[1].path, "testing/flags");
        assert_eq!(hits[1].body["value"], json!(true));
        assert!(hits[0].authorization.as_deref().is_some_and(|a| a.starts_with("Bearer token-")));
        assert_eq!(backend.count("testing/flags"), 2);
    }

    #[tokio::test]
    async fn test_other_tasks_wait_for_setup() {
        let polls = Arc::new(AtomicUsize::new(0));
        let seen = polls.clone();
        let backend = spawn_backend(move |hit| match hit.path.as_str() {
            "testing/flags/t-1/setup" => {
                let ready = seen.fetch_add(1, Ordering::SeqCst) >= 2;
                ok(json!(ready))
            }
            "startup" => app_error(403, 3001, "Maintenance"),
            _ => ok(json!({})),
        })
        .await;
        let mut config = test_config(&backend.url);
        config.test_id = Some("t-1".to_string());
        config.task_index = 1;

        let (result, _) = run(config).await;

        assert!(result.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.count("testing/flags"), 0);
        assert_eq!(backend.count("startup"), 2);
    }

    #[tokio::test]
    async fn test_failed_setup_fails_the_run() {
        let backend = spawn_backend(|hit| match hit.path.as_str() {
            "testing/flags" => app_error(400, 4000, "Unknown test"),
            _ => ok(json!({})),
        })
        .await;
        let mut config = test_config(&backend.url);
        config.test_id = Some("t-1".to_string());

        let (result, _) = run(config).await;

        assert!(matches!(result, Err(RunError::Setup(_))));
        assert_eq!(backend.count("startup"), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_replaces_first_vu() {
        let backend = spawn_backend(|hit| match hit.path.as_str() {
            "health" => (200, json!({ "status": "ok" })),
            "startup" => app_error(403, 3001, "Maintenance"),
            _ => ok(json!({})),
        })
        .await;
        let mut config = test_config(&backend.url);
        config.heartbeat = true;
        config.delay_scale = 0.001;

        let (result, _) = run(config).await;

        assert_eq!(
            result.unwrap(),
            RunSummary {
                finished: 1,
                aborted: 0,
                not_started: 0,
            }
        );
        assert!(backend.count("health") >= 1);
        assert_eq!(backend.count("startup"), 1);
        assert!(backend.hits_to("health").iter().all(|h| h.authorization.is_none()));
    }
}
