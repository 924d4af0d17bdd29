use super::{build_group, similarity_matrix, FaceGroup, GroupInput};
use crate::error::Result;
use std::collections::VecDeque;

const NOISE: i64 = -1;

/// Indices within `eps` cosine distance of `idx`, excluding `idx` itself
fn neighbours(matrix: &[Vec<f32>], idx: usize, eps: f32) -> Vec<usize> {
    matrix[idx]
        .iter()
        .enumerate()
        .filter(|&(j, sim)| j != idx && 1.0 - sim <= eps)
        .map(|(j, _)| j)
        .collect()
}

/// Density-based grouping over cosine distance.
///
/// `eps` is a maximum cosine distance (1 - similarity). A point needs at
/// least `min_points` neighbours, not counting itself, to seed a group. Noise
/// points are returned as singleton groups so every input lands somewhere.
/// Groups are ordered by the first input index they contain.
pub fn dbscan(inputs: &[GroupInput], eps: f32, min_points: usize) -> Result<Vec<FaceGroup>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let matrix = similarity_matrix(inputs)?;
    let n = inputs.len();
    let mut visited = vec![false; n];
    let mut labels = vec![NOISE; n];
    let mut next_label: i64 = 0;

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let seeds = neighbours(&matrix, i, eps);
        if seeds.len() < min_points {
            continue;
        }

        labels[i] = next_label;
        let mut queue: VecDeque<usize> = seeds.into();
        while let Some(current) = queue.pop_front() {
            if !visited[current] {
                visited[current] = true;
                let reach = neighbours(&matrix, current, eps);
                if reach.len() >= min_points {
                    queue.extend(reach);
                }
            }
            if labels[current] == NOISE {
                labels[current] = next_label;
            }
        }
        next_label += 1;
    }

    // groups in order of first appearance; each noise point stands alone
    let mut order: Vec<(String, Vec<usize>)> = Vec::new();
    let mut slot_of_label: Vec<Option<usize>> = vec![None; usize::try_from(next_label).unwrap_or(0)];
    for (i, &label) in labels.iter().enumerate() {
        match usize::try_from(label) {
            Ok(l) => match slot_of_label[l] {
                Some(slot) => order[slot].1.push(i),
                None => {
                    slot_of_label[l] = Some(order.len());
                    order.push((format!("cluster_{l}"), vec![i]));
                }
            },
            Err(_) => order.push((format!("noise_{i}"), vec![i])),
        }
    }

    order
        .into_iter()
        .map(|(id, members)| build_group(id, &members, inputs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: &str, embedding: Vec<f32>) -> GroupInput {
        GroupInput {
            id: id.to_string(),
            embedding,
        }
    }

    #[test]
    fn test_dense_groups_and_noise() {
        let inputs = vec![
            input("a1", vec![1.0, 0.0, 0.0]),
            input("a2", vec![1.0, 0.05, 0.0]),
            input("lone", vec![0.0, 0.0, 1.0]),
            input("b1", vec![0.0, 1.0, 0.0]),
            input("a3", vec![1.0, 0.0, 0.05]),
            input("b2", vec![0.05, 1.0, 0.0]),
            input("b3", vec![0.0, 1.0, 0.05]),
        ];
        let groups = dbscan(&inputs, 0.1, 2).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].id, "cluster_0");
        assert_eq!(groups[0].face_ids, vec!["a1", "a2", "a3"]);
        assert_eq!(groups[1].id, "noise_2");
        assert_eq!(groups[1].face_ids, vec!["lone"]);
        assert_eq!(groups[2].id, "cluster_1");
        assert_eq!(groups[2].face_ids, vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn test_self_is_not_a_neighbour() {
        // a pair has one neighbour each, so min_points = 2 leaves both as noise
        let inputs = vec![
            input("a", vec![1.0, 0.0]),
            input("b", vec![1.0, 0.01]),
        ];
        let groups = dbscan(&inputs, 0.1, 2).unwrap();
        assert_eq!(groups.len(), 2);

        let groups = dbscan(&inputs, 0.1, 1).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].face_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(dbscan(&[], 0.5, 2).unwrap().is_empty());
    }
}
