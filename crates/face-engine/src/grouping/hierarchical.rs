use super::{build_group, similarity_matrix, FaceGroup, GroupInput};
use crate::error::Result;

struct Working {
    id: String,
    members: Vec<usize>,
}

fn average_linkage(matrix: &[Vec<f32>], a: &[usize], b: &[usize]) -> f32 {
    let mut total = 0.0f64;
    for &i in a {
        for &j in b {
            total += f64::from(matrix[i][j]);
        }
    }
    (total / (a.len() * b.len()) as f64) as f32
}

/// Agglomerative average-linkage grouping.
///
/// Each round merges the single most similar pair of groups and stops once
/// the best pair falls below `threshold`. A merged group keeps the id of its
/// first half and moves to the end of the working list, which affects which
/// of several equally similar pairs is found first in later rounds.
///
/// Cost is O(n²) per round and O(n³) overall; this is meant for batches of
/// hundreds of faces, not a whole library.
pub fn hierarchical(inputs: &[GroupInput], threshold: f32) -> Result<Vec<FaceGroup>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let matrix = similarity_matrix(inputs)?;
    let mut groups: Vec<Working> = (0..inputs.len())
        .map(|i| Working {
            id: format!("cluster_{i}"),
            members: vec![i],
        })
        .collect();

    while groups.len() > 1 {
        let mut best: Option<(usize, usize)> = None;
        let mut max_similarity = f32::NEG_INFINITY;

        for i in 0..groups.len() {
            for j in (i + 1)..groups.len() {
                let sim = average_linkage(&matrix, &groups[i].members, &groups[j].members);
                if sim > max_similarity {
                    max_similarity = sim;
                    best = Some((i, j));
                }
            }
        }

        let Some((i, j)) = best else { break };
        if max_similarity < threshold {
            break;
        }

        // j > i, so removing j first leaves i in place
        let second = groups.remove(j);
        let mut first = groups.remove(i);
        first.members.extend(second.members);
        tracing::trace!(group = %first.id, members = first.members.len(), similarity = max_similarity, "merged groups");
        groups.push(first);
    }

    groups
        .into_iter()
        .map(|g| build_group(g.id, &g.members, inputs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn input(id: &str, embedding: Vec<f32>) -> GroupInput {
        GroupInput {
            id: id.to_string(),
            embedding,
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(hierarchical(&[], 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_single_face() {
        let groups = hierarchical(&[input("a", vec![1.0, 0.0])], 0.5).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "cluster_0");
        assert_eq!(groups[0].face_ids, vec!["a"]);
        assert_eq!(groups[0].centroid, vec![1.0, 0.0]);
    }

    #[test]
    fn test_two_people() {
        let inputs = vec![
            input("a1", vec![1.0, 0.05, 0.0]),
            input("b1", vec![0.0, 1.0, 0.05]),
            input("a2", vec![1.0, 0.0, 0.05]),
            input("b2", vec![0.05, 1.0, 0.0]),
            input("a3", vec![0.95, 0.05, 0.05]),
        ];
        let groups = hierarchical(&inputs, 0.8).unwrap();
        assert_eq!(groups.len(), 2);

        let mut sets: Vec<Vec<String>> = groups
            .iter()
            .map(|g| {
                let mut ids = g.face_ids.clone();
                ids.sort();
                ids
            })
            .collect();
        sets.sort();
        assert_eq!(sets, vec![vec!["a1", "a2", "a3"], vec!["b1", "b2"]]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let inputs = vec![
            input("a", vec![1.0, 0.0, 0.0, 0.0]),
            input("b", vec![1.0, 1.0, 1.0, 1.0]),
        ];
        assert_eq!(hierarchical(&inputs, 0.5).unwrap().len(), 1);
        assert_eq!(hierarchical(&inputs, 0.51).unwrap().len(), 2);
    }

    #[test]
    fn test_merged_group_keeps_first_id_and_moves_last() {
        let inputs = vec![
            input("x", vec![0.0, 0.0, 1.0]),
            input("a", vec![1.0, 0.0, 0.0]),
            input("b", vec![1.0, 0.01, 0.0]),
        ];
        let groups = hierarchical(&inputs, 0.9).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, "cluster_0");
        assert_eq!(groups[1].id, "cluster_1");
        assert_eq!(groups[1].face_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_average_linkage_not_centroid() {
        // after a+c merge, b scores 0.45 against their centroid but averages 0.35
        let inputs = vec![
            input("a", vec![1.0, 0.0, 0.0]),
            input("b", vec![0.0, 1.0, 0.0]),
            input("c", vec![1.0, 1.0, 0.0]),
        ];
        let groups = hierarchical(&inputs, 0.4).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].face_ids, vec!["b"]);
        assert_eq!(groups[1].face_ids, vec!["a", "c"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let inputs = vec![input("a", vec![1.0, 0.0]), input("b", vec![1.0])];
        assert!(matches!(
            hierarchical(&inputs, 0.5),
            Err(EngineError::DimensionMismatch { .. })
        ));
    }
}
