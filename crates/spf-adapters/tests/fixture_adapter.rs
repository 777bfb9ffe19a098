use spf_adapters::{FixtureAdapter, SearchQuery, SourceAdapter, SourceScope};

const BUNDLE: &str = r#"{
  "source_id": "sample-portal",
  "captured_at": "2026-03-01T06:00:00Z",
  "listings": [
    {"id": "sp-1", "title": "2 bed terrace", "address": "Walton, Liverpool L4 0TH",
     "price": 45000, "url": "https://sample-portal.example/sp-1",
     "description": "Severe fire damage, uninhabitable"},
    {"id": "sp-2", "title": "Semi", "address": "Headingley, Leeds LS6 3AA",
     "price": 95000, "url": "https://sample-portal.example/sp-2"},
    {"id": "sp-3", "title": "Flat", "address": "Everton, Liverpool L5 1AB",
     "price_text": "Offers over £150,000", "url": "https://sample-portal.example/sp-3"}
  ]
}"#;

#[tokio::test]
async fn fixture_adapter_replays_bundle_filtered_by_query() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("listings.json");
    std::fs::write(&path, BUNDLE).expect("write bundle");

    let adapter = FixtureAdapter::new("sample-portal", SourceScope::Local, &path);
    let drafts = adapter
        .search(&SearchQuery {
            location: "Liverpool".into(),
            radius: 5.0,
            max_price: 100_000.0,
        })
        .await
        .expect("search");

    // sp-3 only states its price as text; the parsed figure is over the ceiling.
    let ids: Vec<_> = drafts.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["sp-1"]);
}

#[tokio::test]
async fn fixture_adapter_rejects_foreign_bundle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("listings.json");
    std::fs::write(&path, BUNDLE).expect("write bundle");

    let adapter = FixtureAdapter::new("other-portal", SourceScope::Local, &path);
    let err = adapter
        .search(&SearchQuery::nationwide(100_000.0))
        .await
        .expect_err("mismatched source id");
    assert!(err.to_string().contains("does not match"));
}

#[tokio::test]
async fn missing_bundle_is_an_adapter_error() {
    let adapter = FixtureAdapter::new("sample-portal", SourceScope::Nationwide, "/nonexistent/listings.json");
    assert!(adapter.search(&SearchQuery::nationwide(100_000.0)).await.is_err());
}
