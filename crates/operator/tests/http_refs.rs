use keel_operator::revision::{Credential, HttpRefLister, RefLister, RemoteRef, Stage};
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MAIN: &str = "1111111111111111111111111111111111111111";
const TAG: &str = "2222222222222222222222222222222222222222";
const PEELED: &str = "3333333333333333333333333333333333333333";

fn pkt(line: &str) -> String { format!("{:04x}{line}", line.len() + 4) }

fn advertisement() -> String {
    [
        pkt("# service=git-upload-pack\n"),
        "0000".to_string(),
        pkt(&format!("{MAIN} HEAD\0multi_ack symref=HEAD:refs/heads/main\n")),
        pkt(&format!("{MAIN} refs/heads/main\n")),
        pkt(&format!("{TAG} refs/tags/v1\n")),
        pkt(&format!("{PEELED} refs/tags/v1^{{}}\n")),
        "0000".to_string(),
    ]
    .concat()
}

fn lister() -> HttpRefLister { HttpRefLister::new(Duration::from_secs(5)).unwrap() }

#[tokio::test]
async fn lists_refs_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x/y.git/info/refs"))
        .and(query_param("service", "git-upload-pack"))
        .and(header("authorization", "Basic b2F1dGgyOnRvaw=="))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/x-git-upload-pack-advertisement")
                .set_body_raw(advertisement(), "application/x-git-upload-pack-advertisement"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/x/y.git", server.uri());
    let refs = lister().list_refs(&url, Credential::Token { username: "oauth2", token: "tok" }).await.unwrap();
    assert_eq!(
        refs,
        vec![
            RemoteRef::new("HEAD", MAIN),
            RemoteRef::new("refs/heads/main", MAIN),
            RemoteRef::new("refs/tags/v1", TAG),
            RemoteRef::new("refs/tags/v1^{}", PEELED),
        ]
    );
}

#[tokio::test]
async fn status_codes_map_to_stages() {
    let server = MockServer::start().await;
    Mock::given(path("/private/info/refs")).respond_with(ResponseTemplate::new(401)).mount(&server).await;
    Mock::given(path("/gone/info/refs")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
    Mock::given(path("/broken/info/refs")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

    let l = lister();
    let err = l.list_refs(&format!("{}/private", server.uri()), Credential::Anonymous).await.unwrap_err();
    assert!(matches!(err.stage, Stage::Authenticate), "{err:?}");
    let err = l.list_refs(&format!("{}/gone", server.uri()), Credential::Anonymous).await.unwrap_err();
    assert!(matches!(err.stage, Stage::NotFound), "{err:?}");
    let err = l.list_refs(&format!("{}/broken", server.uri()), Credential::Anonymous).await.unwrap_err();
    assert!(matches!(err.stage, Stage::Connect), "{err:?}");
}

#[tokio::test]
async fn dumb_http_answers_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(path("/site/info/refs"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html").set_body_string("<html></html>"))
        .mount(&server)
        .await;
    let err = lister().list_refs(&format!("{}/site", server.uri()), Credential::Anonymous).await.unwrap_err();
    assert!(matches!(err.stage, Stage::Connect));
}
