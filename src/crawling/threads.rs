//! # Thread Reconstructor
//!
//! The page never exposes a reply tree, only a flat DOM-ordered stream. Threads
//! are rebuilt with one heuristic: an owner reply that directly follows a
//! non-owner post in DOM order answers that post. Each non-owner author gets one
//! thread per root section; paired owner replies join the thread of the post
//! they answer. Interleaved unrelated sections cannot be told apart and are not
//! corrected for.

use std::collections::HashMap;

use crate::domain::{extract_rest_id, ObservedPost, OutputRow, Pairing, PostId};

/// Output rows plus counters for status text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconstruction {
    pub rows: Vec<OutputRow>,
    pub thread_count: usize,
    pub section_count: usize,
}

/// A reconstructed thread: posts of one non-owner author plus paired owner replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub posts: Vec<(ObservedPost, Pairing)>,
}

impl Thread {
    fn first_non_owner_timestamp(&self, owner: &str) -> &str {
        self.posts
            .iter()
            .map(|(post, _)| post)
            .find(|post| !post.is_authored_by(owner))
            .or_else(|| self.posts.first().map(|(post, _)| post))
            .map_or("", ObservedPost::timestamp_key)
    }
}

#[derive(Debug, Clone)]
pub struct ThreadReconstructor {
    owner: Option<String>,
}

impl ThreadReconstructor {
    #[must_use]
    pub fn new(owner: Option<&str>) -> Self {
        let owner = owner.map(str::trim).filter(|h| !h.is_empty()).map(str::to_string);
        Self { owner }
    }

    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Groups one comment section into sorted threads
    #[must_use]
    pub fn group_into_threads(&self, comments: &[ObservedPost]) -> Vec<Thread> {
        let owner = self.owner.as_deref().unwrap_or_default();
        let mut buckets: Vec<Vec<(ObservedPost, Pairing)>> = Vec::new();
        let mut bucket_of: HashMap<&str, usize> = HashMap::new();
        let mut last_non_owner: Option<(usize, PostId)> = None;

        for post in comments.iter().filter(|p| !p.is_repost) {
            if !post.is_authored_by(owner) {
                let next = buckets.len();
                let index = *bucket_of.entry(post.author_handle.as_str()).or_insert(next);
                if index == next {
                    buckets.push(Vec::new());
                }
                buckets[index].push((post.clone(), Pairing::None));
                last_non_owner = Some((index, post.id.clone()));
                continue;
            }

            // Owner posts that are not replies, or that precede every non-owner post, are dropped
            let Some((index, parent_id)) = last_non_owner.as_ref().filter(|_| post.is_reply) else {
                continue;
            };
            let bucket = &mut buckets[*index];
            if let Some((_, pairing)) = bucket.iter_mut().rev().find(|(p, _)| p.id == *parent_id) {
                match pairing {
                    Pairing::Parent { reply_ids } => reply_ids.push(post.id.clone()),
                    _ => *pairing = Pairing::Parent { reply_ids: vec![post.id.clone()] },
                }
            }
            bucket.push((post.clone(), Pairing::Reply { parent_id: parent_id.clone() }));
        }

        let mut threads: Vec<Thread> = buckets
            .into_iter()
            .filter(|posts| !posts.is_empty())
            .map(|mut posts| {
                posts.sort_by(|(a, _), (b, _)| a.timestamp_key().cmp(b.timestamp_key()));
                Thread { posts }
            })
            .collect();

        threads.sort_by(|a, b| a.first_non_owner_timestamp(owner).cmp(b.first_non_owner_timestamp(owner)));
        threads
    }

    /// Emits the rows of one root section (root plus its comments)
    #[must_use]
    pub fn reconstruct_section(&self, root: &ObservedPost, comments: &[ObservedPost], section_index: usize) -> Reconstruction {
        let mut rows = vec![OutputRow::root(root.clone(), section_index)];

        if self.owner.is_none() {
            rows.extend(comments.iter().filter(|p| !p.is_repost).map(|post| OutputRow {
                depth: 1,
                ..OutputRow::root(post.clone(), section_index)
            }));
            return Reconstruction { rows, thread_count: 0, section_count: 1 };
        }

        let threads = self.group_into_threads(comments);
        for (thread_index, thread) in threads.iter().enumerate() {
            for (post_index, (post, pairing)) in thread.posts.iter().enumerate() {
                rows.push(OutputRow {
                    post: post.clone(),
                    depth: if post_index == 0 { 1 } else { 2 },
                    thread_number: Some(thread_index + 1),
                    post_number_in_thread: Some(post_index + 1),
                    section_index,
                    pairing: pairing.clone(),
                });
            }
        }

        Reconstruction { rows, thread_count: threads.len(), section_count: 1 }
    }

    /// Splits a profile timeline buffer into root sections and reconstructs each
    ///
    /// A root is an owner post that is not a reply. Posts before the first root
    /// have no section and are discarded. Without a known owner the first post
    /// stands in as the only root.
    #[must_use]
    pub fn reconstruct_timeline(&self, buffer: &[ObservedPost]) -> Reconstruction {
        let buffer: Vec<&ObservedPost> = buffer.iter().filter(|p| !p.is_repost).collect();

        let Some(owner) = self.owner.as_deref() else {
            return match buffer.split_first() {
                Some((root, rest)) => {
                    let rest: Vec<ObservedPost> = rest.iter().map(|p| (*p).clone()).collect();
                    self.reconstruct_section(root, &rest, 0)
                }
                None => Reconstruction::default(),
            };
        };

        let mut sections: Vec<(&ObservedPost, Vec<ObservedPost>)> = Vec::new();
        for post in buffer {
            if post.is_authored_by(owner) && !post.is_reply {
                sections.push((post, Vec::new()));
            } else if let Some((_, comments)) = sections.last_mut() {
                comments.push(post.clone());
            }
        }

        let mut result = Reconstruction::default();
        for (section_index, (root, comments)) in sections.iter().enumerate() {
            let section = self.reconstruct_section(root, comments, section_index);
            result.rows.extend(section.rows);
            result.thread_count += section.thread_count;
            result.section_count += 1;
        }
        result
    }
}

/// Reconstructs a single status page
///
/// The root is the post whose rest id matches the page (else the first post);
/// its author is the owner for threading.
#[must_use]
pub fn reconstruct_status_page(buffer: &[ObservedPost], root_rest_id: Option<&str>) -> Reconstruction {
    let buffer: Vec<&ObservedPost> = buffer.iter().filter(|p| !p.is_repost).collect();
    let root_index = root_rest_id
        .and_then(|rest_id| {
            buffer
                .iter()
                .position(|p| extract_rest_id(p.id.as_str()).as_deref() == Some(rest_id))
        })
        .unwrap_or(0);

    let Some(root) = buffer.get(root_index) else {
        return Reconstruction::default();
    };

    let comments: Vec<ObservedPost> = buffer
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != root_index)
        .map(|(_, post)| (*post).clone())
        .collect();

    ThreadReconstructor::new(Some(&root.author_handle)).reconstruct_section(root, &comments, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(n: u64, handle: &str, ts: &str) -> ObservedPost {
        ObservedPost::new(format!("https://x.com/{handle}/status/{n}"), format!("@{handle}"), ts)
    }

    fn summary(rows: &[OutputRow]) -> Vec<(String, u8, Option<usize>)> {
        rows.iter()
            .map(|r| (r.post.id.rest_id().unwrap_or_default(), r.depth, r.thread_number))
            .collect()
    }

    #[test]
    fn owner_reply_joins_preceding_thread() {
        let buffer = vec![
            post(1, "owner", "2024-01-01T00:00:00Z"),
            post(2, "alice", "2024-01-01T00:01:00Z"),
            post(3, "bob", "2024-01-01T00:02:00Z"),
            post(4, "owner", "2024-01-01T00:03:00Z").reply(),
        ];
        let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);
        assert_eq!(
            summary(&rec.rows),
            vec![
                ("1".into(), 0, None),
                ("2".into(), 1, Some(1)),
                ("3".into(), 1, Some(2)),
                ("4".into(), 2, Some(2)),
            ]
        );
        assert_eq!(rec.rows[2].pairing, Pairing::Parent { reply_ids: vec![buffer[3].id.clone()] });
        assert_eq!(rec.rows[3].pairing.parent_id(), Some(&buffer[2].id));
    }

    #[test]
    fn owner_reply_without_preceding_post_is_dropped() {
        let buffer = vec![
            post(1, "owner", "t0"),
            post(2, "owner", "t1").reply(),
            post(3, "alice", "t2"),
        ];
        let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);
        assert_eq!(summary(&rec.rows), vec![("1".into(), 0, None), ("3".into(), 1, Some(1))]);
    }

    #[test]
    fn unknown_owner_falls_back_to_flat_depth() {
        let buffer = vec![post(1, "a", "t2"), post(2, "b", "t1"), post(3, "c", "t0")];
        let rec = ThreadReconstructor::new(None).reconstruct_timeline(&buffer);
        assert_eq!(
            summary(&rec.rows),
            vec![("1".into(), 0, None), ("2".into(), 1, None), ("3".into(), 1, None)]
        );
        assert_eq!(rec.thread_count, 0);
    }

    #[test]
    fn sections_split_on_owner_roots() {
        let buffer = vec![
            post(9, "alice", "t0"),
            post(1, "owner", "t1"),
            post(2, "alice", "t2"),
            post(5, "owner", "t5"),
            post(6, "bob", "t6"),
        ];
        let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);
        assert_eq!(rec.section_count, 2);
        let sections: Vec<usize> = rec.rows.iter().map(|r| r.section_index).collect();
        assert_eq!(sections, vec![0, 0, 1, 1]);
    }

    #[test]
    fn root_alone_yields_one_row() {
        let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&[post(1, "owner", "t")]);
        assert_eq!(rec.rows.len(), 1);
    }

    #[test]
    fn empty_timestamps_sort_first_and_reposts_are_filtered() {
        let buffer = vec![
            post(1, "owner", "t0"),
            post(2, "alice", "2024-02"),
            post(3, "alice", ""),
            post(4, "bob", "2024-01").repost(),
        ];
        let rec = ThreadReconstructor::new(Some("@owner")).reconstruct_timeline(&buffer);
        assert_eq!(
            summary(&rec.rows),
            vec![("1".into(), 0, None), ("3".into(), 1, Some(1)), ("2".into(), 2, Some(1))]
        );
    }

    #[test]
    fn status_page_root_found_by_rest_id() {
        let buffer = vec![
            post(10, "alice", "t0"),
            post(20, "carol", "t1"),
            post(30, "carol", "t2").reply(),
        ];
        let rec = reconstruct_status_page(&buffer, Some("20"));
        assert_eq!(rec.rows[0].post.id.rest_id().as_deref(), Some("20"));
        assert_eq!(
            summary(&rec.rows),
            vec![("20".into(), 0, None), ("10".into(), 1, Some(1)), ("30".into(), 2, Some(1))]
        );

        let fallback = reconstruct_status_page(&buffer, Some("999"));
        assert_eq!(fallback.rows[0].post.id.rest_id().as_deref(), Some("10"));
        assert!(reconstruct_status_page(&[], None).rows.is_empty());
    }
}
