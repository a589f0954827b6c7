//! Constructor lifecycle: preRun getter-then-delete cleanup, the main
//! creation, and the postRun destructor, in that order.

mod common;

use hdt_cli::descriptor::NameSet;
use hdt_cli::engine;
use hdt_cli::loader;
use hdt_cli::runtime::hooks::{FcnRegistry, HookRegistry};
use hdt_cli::runtime::http::ReqwestDispatch;
use hdt_cli::runtime::{RunOptions, Runtime};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_lifecycle_descriptors(root: &std::path::Path) {
    common::descriptor(
        root,
        "createApp.yaml",
        concat!(
            "request:\n",
            "  method: POST\n",
            "  path: /apps\n",
            "  body: { name: \"$appName\" }\n",
            "responses:\n",
            "  201:\n",
            "    descr: created\n",
            "    body:\n",
            "      guid:\n",
            "        __: \"(s)the app guid\"\n",
            "        var_new: { name: appGuid, get: getApp, delete: delApp }\n",
        ),
    );
    common::descriptor(
        root,
        "getApp.yaml",
        concat!(
            "request:\n",
            "  method: GET\n",
            "  path: /apps/$appName\n",
            "responses:\n",
            "  200:\n",
            "    descr: found\n",
            "    body:\n",
            "      guid: { __: \"(s)the app guid\", var_set: { name: appGuid } }\n",
        ),
    );
    common::descriptor(
        root,
        "delApp.yaml",
        concat!(
            "request:\n",
            "  method: DELETE\n",
            "  path: /apps/$appGuid\n",
            "responses:\n",
            "  200: { descr: deleted, ignore_body: true }\n",
        ),
    );
}

#[tokio::test]
async fn constructor_runs_cleanup_around_its_subtree() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/apps/demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guid": "old-guid"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/apps/old-guid"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/apps"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"guid": "new-guid"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/apps/new-guid"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = common::project("  appName: { descr: the app name, value: demo }\n");
    write_lifecycle_descriptors(dir.path());

    let project = loader::load_dir(dir.path()).unwrap();
    let mut extra = IndexMap::new();
    extra.insert("uaaHost".to_string(), json!(server.uri()));
    let compiled =
        engine::compile_project(&project, &extra, &[], &NameSet::new()).unwrap();
    let runtime = Runtime::new(
        compiled.plan,
        Arc::new(ReqwestDispatch::new().unwrap()),
        HookRegistry::new(),
        FcnRegistry::new(),
        RunOptions::default(),
    );
    let report = runtime.run(&compiled.env).await;

    // Only the constructor context counts; satellites do not.
    assert_eq!(report.passed, 1);
    assert_eq!(report.failed, 0);

    let received = server.received_requests().await.unwrap();
    let sequence: Vec<String> = received
        .iter()
        .map(|r| format!("{} {}", r.method, r.url.path()))
        .collect();
    assert_eq!(
        sequence,
        vec![
            "GET /apps/demo",
            "DELETE /apps/old-guid",
            "POST /apps",
            "DELETE /apps/new-guid",
        ],
        "preRun cleanup, creation, postRun teardown, in order"
    );
}

#[tokio::test]
async fn equal_serial_keys_do_not_overlap() {
    let server = MockServer::start().await;
    for space in [1, 2] {
        Mock::given(method("POST"))
            .and(path(format!("/envs/{space}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"guid": format!("s{space}")})),
            )
            .expect(1)
            .mount(&server)
            .await;
    }
    // No leftover app: the preRun getter finds nothing, so only the
    // creations and the postRun deletions touch /apps.
    Mock::given(method("GET"))
        .and(path("/apps/demo"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/apps"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"guid": "new-guid"})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/apps/new-guid"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let dir = common::project("  appName: { descr: the app name, value: demo }\n");
    for space in [1, 2] {
        common::descriptor(
            dir.path(),
            &format!("makeEnv{space}.yaml"),
            &format!(
                concat!(
                    "request:\n",
                    "  method: POST\n",
                    "  path: /envs/{space}\n",
                    "responses:\n",
                    "  200:\n",
                    "    descr: environment ready\n",
                    "    body:\n",
                    "      guid: {{ __: \"(s)space guid\", var_set: {{ name: spaceId }} }}\n",
                ),
                space = space
            ),
        );
    }
    // Both producers of spaceId host the constructor, so two contexts
    // with the same appName run concurrently.
    common::descriptor(
        dir.path(),
        "createApp.yaml",
        concat!(
            "request:\n",
            "  method: POST\n",
            "  path: /apps\n",
            "  body: { name: \"$appName\", space: \"$spaceId\" }\n",
            "responses:\n",
            "  201:\n",
            "    descr: created\n",
            "    body:\n",
            "      guid:\n",
            "        __: \"(s)the app guid\"\n",
            "        var_new:\n",
            "          name: appGuid\n",
            "          get: getApp\n",
            "          delete: delApp\n",
            "          serial_vars: [appName]\n",
        ),
    );
    common::descriptor(
        dir.path(),
        "getApp.yaml",
        concat!(
            "request:\n",
            "  method: GET\n",
            "  path: /apps/$appName\n",
            "responses:\n",
            "  200:\n",
            "    descr: found\n",
            "    body:\n",
            "      guid: { __: \"(s)the app guid\", var_set: { name: appGuid } }\n",
        ),
    );
    common::descriptor(
        dir.path(),
        "delApp.yaml",
        concat!(
            "request:\n",
            "  method: DELETE\n",
            "  path: /apps/$appGuid\n",
            "responses:\n",
            "  200: { descr: deleted, ignore_body: true }\n",
        ),
    );

    let project = loader::load_dir(dir.path()).unwrap();
    let mut extra = IndexMap::new();
    extra.insert("uaaHost".to_string(), json!(server.uri()));
    let compiled =
        engine::compile_project(&project, &extra, &[], &NameSet::new()).unwrap();
    let runtime = Runtime::new(
        compiled.plan,
        Arc::new(ReqwestDispatch::new().unwrap()),
        HookRegistry::new(),
        FcnRegistry::new(),
        RunOptions::default(),
    );
    let report = runtime.run(&compiled.env).await;
    assert_eq!(report.failed, 0);
    // Two producers and two constructor contexts.
    assert_eq!(report.passed, 4);

    // The second creation must wait for the first context's postRun: the
    // creations and deletions nest perfectly, never interleave.
    let received = server.received_requests().await.unwrap();
    let lifecycle: Vec<String> = received
        .iter()
        .map(|r| format!("{} {}", r.method, r.url.path()))
        .filter(|line| line == "POST /apps" || line == "DELETE /apps/new-guid")
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            "POST /apps",
            "DELETE /apps/new-guid",
            "POST /apps",
            "DELETE /apps/new-guid",
        ]
    );
}

#[tokio::test]
async fn pre_run_failures_are_ignored() {
    let server = MockServer::start().await;
    // The getter finds nothing; the preRun chain fails silently.
    Mock::given(method("GET"))
        .and(path("/apps/demo"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/apps"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"guid": "new-guid"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/apps/new-guid"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = common::project("  appName: { descr: the app name, value: demo }\n");
    write_lifecycle_descriptors(dir.path());

    let project = loader::load_dir(dir.path()).unwrap();
    let mut extra = IndexMap::new();
    extra.insert("uaaHost".to_string(), json!(server.uri()));
    let compiled =
        engine::compile_project(&project, &extra, &[], &NameSet::new()).unwrap();
    let runtime = Runtime::new(
        compiled.plan,
        Arc::new(ReqwestDispatch::new().unwrap()),
        HookRegistry::new(),
        FcnRegistry::new(),
        RunOptions::default(),
    );
    let report = runtime.run(&compiled.env).await;

    assert_eq!(report.passed, 1, "a failing preRun must not fail the run");
    assert_eq!(report.failed, 0);
}
