use std::collections::BTreeSet;

use serde::Serialize;

use crate::producer::ResultItem;

/// One result slot as shown to the caller: either the full item or a locked
/// placeholder at the same position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct PresentedItem {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

pub(crate) fn present_results(
    items: &[ResultItem],
    hidden: &BTreeSet<usize>,
) -> Vec<PresentedItem> {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            if hidden.contains(&idx) {
                PresentedItem {
                    locked: true,
                    id: None,
                    url: None,
                    score: None,
                }
            } else {
                PresentedItem {
                    locked: false,
                    id: Some(item.id.clone()),
                    url: Some(item.url.clone()),
                    score: Some(item.score),
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<ResultItem> {
        (0..n)
            .map(|idx| ResultItem {
                id: format!("m-{idx}"),
                url: format!("https://results.example/m-{idx}"),
                score: 1.0 - idx as f64 * 0.01,
            })
            .collect()
    }

    #[test]
    fn hidden_positions_become_locked_placeholders() {
        let hidden: BTreeSet<usize> = [1, 3].into_iter().collect();
        let presented = present_results(&items(4), &hidden);

        assert_eq!(presented.len(), 4);
        assert!(!presented[0].locked);
        assert!(presented[1].locked);
        assert!(!presented[2].locked);
        assert!(presented[3].locked);

        assert_eq!(presented[0].id.as_deref(), Some("m-0"));
        assert_eq!(presented[1].id, None);
        assert_eq!(presented[1].url, None);
        assert_eq!(presented[1].score, None);
    }

    #[test]
    fn empty_hidden_set_keeps_everything_visible() {
        let presented = present_results(&items(3), &BTreeSet::new());
        assert!(presented.iter().all(|item| !item.locked));
    }

    #[test]
    fn locked_placeholder_serializes_without_item_fields() {
        let hidden: BTreeSet<usize> = [0].into_iter().collect();
        let presented = present_results(&items(1), &hidden);
        let json = serde_json::to_string(&presented[0]).expect("placeholder should serialize");
        assert_eq!(json, r#"{"locked":true}"#);
    }
}
