use std::path::{Path, PathBuf};

use jobwatch_adapters::{FixtureListingSource, ListingSource, ScrapeContext};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/itjobs")
}

#[tokio::test]
async fn fixture_pages_stop_at_first_empty_page() {
    let source = FixtureListingSource::new(fixture_dir());
    let batch = source
        .fetch_listings(&ScrapeContext::new())
        .await
        .expect("fixture scrape");

    // page-1 and page-2 carry postings, page-3 is empty, page-4 must never be read.
    assert_eq!(batch.pages.len(), 3);
    assert_eq!(batch.listings.len(), 5);
    assert!(batch
        .listings
        .iter()
        .all(|l| l.link.as_deref() != Some("/oferta/1/never-reached")));

    let dates = batch
        .listings
        .iter()
        .map(|l| l.date_text.as_deref().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(dates, vec!["14 out", "14 out", "9 set", "2 ???", "2 ???"]);

    let junior = &batch.listings[1];
    assert_eq!(junior.company.as_deref(), Some("Informática São João"));
    assert_eq!(junior.details.as_deref(), Some("Porto Híbrido"));
}

#[tokio::test]
async fn missing_fixture_dir_is_an_error_not_an_empty_batch() {
    let source = FixtureListingSource::new(fixture_dir().join("does-not-exist"));
    assert!(source.fetch_listings(&ScrapeContext::new()).await.is_err());
}

const ONE_POSTING_PAGE: &str = r#"<html><body>
<div class="block borderless">
  <div class="date-box"><div class="d-d">3</div><div class="d-m">out</div></div>
  <ul class="listing"><li><div class="list-title"><a href="/oferta/LINK">Analyst</a></div></li></ul>
</div>
</body></html>"#;

#[tokio::test]
async fn fixture_pages_are_read_in_page_number_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, link) in [("page-1.html", "1"), ("page-2.html", "2"), ("page-9.html", "9")] {
        std::fs::write(dir.path().join(name), ONE_POSTING_PAGE.replace("LINK", link))
            .expect("write page");
    }
    std::fs::write(dir.path().join("page-10.html"), "<html><body></body></html>")
        .expect("write page");

    let batch = FixtureListingSource::new(dir.path())
        .fetch_listings(&ScrapeContext::new())
        .await
        .expect("fixture scrape");

    let links = batch
        .listings
        .iter()
        .map(|l| l.link.as_deref().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(links, vec!["/oferta/1", "/oferta/2", "/oferta/9"]);
    assert_eq!(batch.pages.len(), 4);
}
