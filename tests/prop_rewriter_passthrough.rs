// Property: how the upstream body is split into chunks never changes the
// rewritten output, and bodies that are not rewritten leave byte-for-byte
// identical.

use bytes::Bytes;
use http::HeaderMap;
use pingora_seo::edge::{PagePlan, PageRewrite};
use pingora_seo::{EdgePipeline, SeoConfig, SlugResolver};
use proptest::prelude::*;
use std::sync::Arc;

fn pipeline() -> EdgePipeline {
    let mut config = SeoConfig::default();
    config.count_lookup.enabled = false;
    let resolver = Arc::new(SlugResolver::new(config.effective_aliases().unwrap()));
    EdgePipeline::new(&config, resolver).unwrap()
}

fn plan(pipeline: &EdgePipeline, slug: &str, count: Option<usize>) -> PagePlan {
    let view = pipeline.resolver().resolve(slug);
    pipeline.plan_for(
        view,
        count,
        "https://lists.example.com",
        &format!("/resources/top-investor-lists/{}", slug),
        None,
    )
}

fn headers(content_type: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", content_type.parse().unwrap());
    headers
}

/// Feed `body` split at the given sizes (cycled), then signal the end
fn run(rewrite: &mut PageRewrite, body: &[u8], sizes: &[usize]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut i = 0;
    while pos < body.len() {
        let size = sizes[i % sizes.len()].max(1);
        let end = (pos + size).min(body.len());
        if let Some(bytes) = rewrite.on_chunk(Some(Bytes::copy_from_slice(&body[pos..end])), false) {
            out.extend_from_slice(&bytes);
        }
        pos = end;
        i += 1;
    }
    if let Some(bytes) = rewrite.on_chunk(None, true) {
        out.extend_from_slice(&bytes);
    }
    out
}

fn fragment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z0-9 .,]{0,40}",
        Just("<title>Old title</title>".to_string()),
        Just("<meta name=\"description\" content=\"old\">".to_string()),
        Just("<meta property=\"og:title\" content=\"old\">".to_string()),
        Just("<link rel=\"canonical\" href=\"/old\">".to_string()),
        Just("<h1 class=\"hero-headline\">Top Investors</h1>".to_string()),
        Just("<p class=\"hero-copy\">Copy</p>".to_string()),
        Just("<!-- a comment with <title> inside -->".to_string()),
        Just("<script>if (a < b) { x = \"</div>\"; }</script>".to_string()),
        Just("<style>p > a { color: red }</style>".to_string()),
        Just("<div id=\"app\"><span>text</span></div>".to_string()),
        Just("<img src=\"/a.png\" alt=\"a > b\">".to_string()),
        Just("<div class=\"hero\"><p class=\"hero-copy\">Unclosed</div>".to_string()),
        Just("<section><h1 class=\"hero-headline\">Unclosed <em>x</em></section>".to_string()),
    ]
}

fn document() -> impl Strategy<Value = String> {
    (
        proptest::collection::vec(fragment(), 0..6),
        proptest::collection::vec(fragment(), 0..8),
    )
        .prop_map(|(head, body)| {
            format!(
                "<!doctype html><html><head>{}</head><body>{}</body></html>",
                head.concat(),
                body.concat()
            )
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_chunking_does_not_change_output(
        doc in document(),
        sizes in proptest::collection::vec(1usize..64, 1..8),
        slug in prop_oneof![Just("ai"), Just("bio-pre-seed"), Just("")],
        count in proptest::option::of(0usize..500),
    ) {
        let pipeline = pipeline();
        let plan = plan(&pipeline, slug, count);
        let html = headers("text/html; charset=utf-8");

        let (mut whole, _) = pipeline.start_response(&plan, 200, &html);
        let expected = run(&mut whole, doc.as_bytes(), &[doc.len().max(1)]);

        let (mut chunked, _) = pipeline.start_response(&plan, 200, &html);
        let actual = run(&mut chunked, doc.as_bytes(), &sizes);

        prop_assert_eq!(actual, expected);
        prop_assert_eq!(chunked.outcome(), whole.outcome());
    }

    #[test]
    fn prop_content_after_implicitly_closed_hero_survives(
        before in proptest::collection::vec(
            fragment().prop_filter("script text holds markup", |f| !f.contains("<script")),
            0..4,
        ),
        sizes in proptest::collection::vec(1usize..64, 1..8),
    ) {
        let pipeline = pipeline();
        let plan = plan(&pipeline, "ai", None);
        let doc = format!(
            "<html><head></head><body>{}<div class=\"hero\"><p class=\"hero-copy\">Default</div>\
             <a href=\"/x\">KEEP-LINK</a><span>KEEP-SPAN</span></body></html>",
            before.concat()
        );

        let (mut rewrite, _) = pipeline.start_response(&plan, 200, &headers("text/html"));
        let out = String::from_utf8(run(&mut rewrite, doc.as_bytes(), &sizes)).unwrap();

        prop_assert!(!out.contains("hero-copy\">Default"));
        prop_assert!(out.contains("<a href=\"/x\">KEEP-LINK</a><span>KEEP-SPAN</span></body></html>"));
        prop_assert_eq!(out.matches("<div").count(), out.matches("</div>").count());
    }

    #[test]
    fn prop_non_html_is_identity(
        body in proptest::collection::vec(any::<u8>(), 0..4096),
        sizes in proptest::collection::vec(1usize..512, 1..6),
        content_type in prop_oneof![
            Just("application/json"),
            Just("image/png"),
            Just("text/css"),
            Just("application/octet-stream"),
        ],
    ) {
        let pipeline = pipeline();
        let plan = plan(&pipeline, "ai", Some(7));
        let (mut rewrite, edits) = pipeline.start_response(&plan, 200, &headers(content_type));

        prop_assert!(edits.insert.is_empty());
        prop_assert_eq!(run(&mut rewrite, &body, &sizes), body);
    }

    #[test]
    fn prop_error_status_is_identity(
        doc in document(),
        status in prop_oneof![Just(301u16), Just(404u16), Just(500u16), Just(503u16)],
    ) {
        let pipeline = pipeline();
        let plan = plan(&pipeline, "ai", None);
        let (mut rewrite, _) = pipeline.start_response(&plan, status, &headers("text/html"));
        prop_assert_eq!(run(&mut rewrite, doc.as_bytes(), &[17]), doc.into_bytes());
    }
}
