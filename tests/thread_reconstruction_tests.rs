//! Thread reconstruction over whole run buffers
use rstest::rstest;

use timeline_harvester::crawling::{reconstruct_status_page, ThreadReconstructor};
use timeline_harvester::domain::{ObservedPost, OutputRow, Pairing};

fn post(n: u64, handle: &str, ts: &str) -> ObservedPost {
    ObservedPost::new(format!("https://x.com/{handle}/status/{n}"), format!("@{handle}"), ts)
}

fn layout(rows: &[OutputRow]) -> Vec<(String, u8, Option<usize>, Option<usize>)> {
    rows.iter()
        .map(|r| {
            (
                r.post.id.rest_id().unwrap_or_default(),
                r.depth,
                r.thread_number,
                r.post_number_in_thread,
            )
        })
        .collect()
}

#[test]
fn owner_reply_after_first_commenter_joins_that_thread() {
    // DOM order: the owner answered A before B's comment was rendered
    let buffer = vec![
        post(1, "owner", "t0"),
        post(2, "alice", "t1"),
        post(4, "owner", "t3").reply(),
        post(3, "bob", "t2"),
    ];
    let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);

    assert_eq!(
        layout(&rec.rows),
        vec![
            ("1".into(), 0, None, None),
            ("2".into(), 1, Some(1), Some(1)),
            ("4".into(), 2, Some(1), Some(2)),
            ("3".into(), 1, Some(2), Some(1)),
        ]
    );
    assert_eq!(rec.thread_count, 2);
    assert!(rec.rows[1].pairing.is_parent());
    assert_eq!(rec.rows[2].pairing.parent_id(), Some(&buffer[1].id));
}

#[test]
fn threads_are_ordered_by_first_commenter_timestamp() {
    let buffer = vec![
        post(1, "owner", "2024-01-01T00:00:00Z"),
        post(5, "zoe", "2024-01-01T00:05:00Z"),
        post(2, "alice", "2024-01-01T00:01:00Z"),
        post(6, "alice", "2024-01-01T00:06:00Z"),
    ];
    let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);

    assert_eq!(
        layout(&rec.rows),
        vec![
            ("1".into(), 0, None, None),
            ("2".into(), 1, Some(1), Some(1)),
            ("6".into(), 2, Some(1), Some(2)),
            ("5".into(), 1, Some(2), Some(1)),
        ]
    );
}

#[test]
fn consecutive_owner_replies_pair_with_the_same_parent() {
    let buffer = vec![
        post(1, "owner", "t0"),
        post(2, "alice", "t1"),
        post(3, "owner", "t2").reply(),
        post(4, "owner", "t3").reply(),
    ];
    let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);

    let reply_ids = vec![buffer[2].id.clone(), buffer[3].id.clone()];
    assert_eq!(rec.rows[1].pairing, Pairing::Parent { reply_ids });
    assert_eq!(rec.thread_count, 1);
    assert_eq!(rec.rows.len(), 4);
}

#[rstest]
#[case(None)]
#[case(Some("   "))]
fn unknown_owner_keeps_dom_order_flat(#[case] owner: Option<&str>) {
    let buffer = vec![post(1, "owner", "t9"), post(2, "bob", "t5"), post(3, "alice", "t1")];
    let rec = ThreadReconstructor::new(owner).reconstruct_timeline(&buffer);

    assert_eq!(
        layout(&rec.rows),
        vec![
            ("1".into(), 0, None, None),
            ("2".into(), 1, None, None),
            ("3".into(), 1, None, None),
        ]
    );
}

#[test]
fn status_page_uses_root_author_as_owner() {
    let buffer = vec![
        post(7, "carol", "t0"),
        post(8, "dave", "t1"),
        post(9, "carol", "t2").reply(),
    ];
    let rec = reconstruct_status_page(&buffer, Some("7"));
    assert_eq!(
        layout(&rec.rows),
        vec![
            ("7".into(), 0, None, None),
            ("8".into(), 1, Some(1), Some(1)),
            ("9".into(), 2, Some(1), Some(2)),
        ]
    );
}

#[test]
fn timeline_sections_are_concatenated_in_order() {
    let buffer = vec![
        post(1, "owner", "t0"),
        post(2, "alice", "t1"),
        post(3, "owner", "t2"),
        post(4, "bob", "t3"),
        post(5, "owner", "t4").reply(),
    ];
    let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);

    assert_eq!(rec.section_count, 2);
    assert_eq!(rec.thread_count, 2);
    let sections: Vec<(String, usize)> = rec
        .rows
        .iter()
        .map(|r| (r.post.id.rest_id().unwrap_or_default(), r.section_index))
        .collect();
    assert_eq!(
        sections,
        vec![("1".into(), 0), ("2".into(), 0), ("3".into(), 1), ("4".into(), 1), ("5".into(), 1)]
    );
}
