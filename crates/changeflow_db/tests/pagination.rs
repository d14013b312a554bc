//! Property tests for paged issue listing.
//!
//! Walking pages until the token is empty must return every matching
//! issue exactly once, in the same order as an unpaged listing.

use changeflow_db::{IssueFind, NewIssue, Store};
use changeflow_ids::ProjectId;
use changeflow_protocol::{IssuePayload, IssueType, Pagination};
use proptest::prelude::*;
use std::collections::HashSet;
use tempfile::TempDir;

fn new_issue(project: &str, n: usize) -> NewIssue {
    NewIssue {
        project: ProjectId::parse(project).unwrap(),
        creator: "bob@x".into(),
        title: format!("issue {}", n),
        description: String::new(),
        issue_type: IssueType::DatabaseChange,
        plan_uid: None,
        pipeline_uid: None,
        payload: IssuePayload::default(),
        subscribers: vec![],
    }
}

async fn walk_pages(store: &Store, find: &IssueFind, page_size: i32) -> Vec<i64> {
    let mut uids = Vec::new();
    let mut token = String::new();
    loop {
        let page = Pagination::parse(page_size, &token).unwrap();
        let mut paged = find.clone();
        paged.limit = Some(page.fetch_limit());
        paged.offset = Some(page.offset);
        let rows = store.find_issues(&paged).await.unwrap();
        let (rows, next) = page.finish(rows);
        uids.extend(rows.iter().map(|i| i.uid));
        if next.is_empty() {
            return uids;
        }
        token = next;
    }
}

async fn seeded(p1: usize, p2: usize) -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("pages.db")).await.unwrap();
    for n in 0..p1 {
        store.create_issue(&new_issue("p1", n)).await.unwrap();
    }
    for n in 0..p2 {
        store.create_issue(&new_issue("p2", n)).await.unwrap();
    }
    (store, dir)
}

#[tokio::test]
async fn test_exact_multiple_of_page_size_ends_with_empty_token() {
    let (store, _dir) = seeded(4, 0).await;
    let uids = walk_pages(&store, &IssueFind::default(), 2).await;
    assert_eq!(uids.len(), 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_pages_cover_each_match_once(p1 in 0usize..12, p2 in 0usize..6, page_size in 1i32..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (paged, full) = rt.block_on(async {
            let (store, _dir) = seeded(p1, p2).await;
            let find = IssueFind {
                project_ids: Some(vec![ProjectId::parse("p1").unwrap()]),
                ..Default::default()
            };
            let paged = walk_pages(&store, &find, page_size).await;
            let full: Vec<i64> = store
                .find_issues(&find)
                .await
                .unwrap()
                .into_iter()
                .map(|i| i.uid)
                .collect();
            (paged, full)
        });

        let unique: HashSet<_> = paged.iter().collect();
        prop_assert_eq!(unique.len(), paged.len());
        prop_assert_eq!(paged.len(), p1);
        prop_assert_eq!(paged, full);
    }
}
