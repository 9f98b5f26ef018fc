//! Partitioning property tests
//!
//! Tests for:
//! - Unique point ownership across arbitrary group sizes
//! - Exit-face / neighbor agreement with epsilon-pushed crossings
//! - Grid factorization shape
//! - Tiling of the global box without gaps or overlaps

use glam::Vec3;
use nebula::geometry::Box3;
use nebula::partition::{Partition, PartitionMeta, factor};
use rand::{Rng, RngExt};

// ============================================================================
// Helpers
// ============================================================================

fn build(n: usize, global_box: Box3) -> Vec<Partition> {
    let meta = PartitionMeta {
        global_box,
        n_partitions: n,
    };
    (0..n).map(|r| Partition::new(&meta, r)).collect()
}

fn random_point(rng: &mut impl Rng, b: &Box3) -> Vec3 {
    Vec3::new(
        rng.random_range(b.min.x..b.max.x),
        rng.random_range(b.min.y..b.max.y),
        rng.random_range(b.min.z..b.max.z),
    )
}

fn random_dir(rng: &mut impl Rng) -> Vec3 {
    loop {
        let v = Vec3::new(
            rng.random_range(-1.0f32..1.0),
            rng.random_range(-1.0f32..1.0),
            rng.random_range(-1.0f32..1.0),
        );
        if v.length_squared() > 1e-3 {
            return v.normalize();
        }
    }
}

// ============================================================================
// Ownership
// ============================================================================

#[test]
fn every_point_has_exactly_one_owner() {
    let global = Box3::new(Vec3::new(-3.0, -1.0, 0.0), Vec3::new(5.0, 2.0, 4.0));
    let mut rng = rand::rng();

    for n in [1, 2, 3, 4, 6, 8, 12, 17] {
        let parts = build(n, global);
        for _ in 0..200 {
            let p = random_point(&mut rng, &global);
            let owner = parts[0].owner(p).expect("interior point has an owner");
            let claiming: Vec<usize> = parts
                .iter()
                .enumerate()
                .filter(|(_, part)| part.owns(p, 0.0))
                .map(|(r, _)| r)
                .collect();
            assert!(
                claiming.contains(&owner),
                "n={n}: owner {owner} does not contain {p:?} (claimed by {claiming:?})"
            );
            // Shared faces allow multiple boxes to contain the point,
            // but the owner map picks exactly one
            for part in &parts {
                assert_eq!(part.owner(p), Some(owner), "n={n}: owner map disagrees");
            }
        }
    }
}

#[test]
fn points_outside_the_global_box_have_no_owner() {
    let parts = build(4, Box3::unit());
    assert_eq!(parts[0].owner(Vec3::new(2.0, 0.0, 0.0)), None);
    assert_eq!(parts[0].owner(Vec3::new(0.0, -1.5, 0.0)), None);
}

// ============================================================================
// Exit faces and neighbor crossing
// ============================================================================

#[test]
fn epsilon_pushed_exit_lands_in_the_neighbor() {
    let global = Box3::new(Vec3::new(-2.0, -2.0, -2.0), Vec3::new(2.0, 2.0, 2.0));
    let mut rng = rand::rng();

    for n in [2, 4, 8, 6] {
        let parts = build(n, global);
        for _ in 0..300 {
            let rank = rng.random_range(0..n);
            let part = &parts[rank];
            let origin = random_point(&mut rng, &part.local_box());
            let dir = random_dir(&mut rng);

            let face = part.exit_face(origin, dir);
            let t = part.local_box().exit_t(origin, dir);
            let crossed = origin + dir * (t + part.epsilon());

            match part.neighbor(face) {
                Some(nbr) => {
                    assert!(
                        parts[nbr].owns(crossed, part.epsilon()),
                        "n={n} rank={rank} face={face}: {crossed:?} not in neighbor {nbr}"
                    );
                }
                None => {
                    assert!(
                        !global.contains(crossed, -part.epsilon()),
                        "n={n} rank={rank} face={face}: external crossing stayed inside"
                    );
                }
            }
        }
    }
}

// ============================================================================
// Factorization and tiling
// ============================================================================

#[test]
fn factorization_is_exact_and_compact() {
    for n in 1..=64usize {
        let f = factor(n);
        assert_eq!((f.x * f.y * f.z) as usize, n, "factor({n}) product");
        // No factorization of n can beat the one chosen
        for i in 1..=n {
            if n % i != 0 {
                continue;
            }
            let jk = n / i;
            for j in 1..=jk {
                if jk % j != 0 {
                    continue;
                }
                let k = jk / j;
                assert!(
                    (f.x + f.y + f.z) as usize <= i + j + k,
                    "factor({n}) = {f:?} beaten by ({i}, {j}, {k})"
                );
            }
        }
    }
}

#[test]
fn sub_boxes_tile_the_global_volume() {
    let global = Box3::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(7.0, 3.0, 5.0));
    for n in [1, 2, 5, 8, 12] {
        let parts = build(n, global);
        let total: f32 = parts
            .iter()
            .map(|p| {
                let e = p.local_box().extent();
                e.x * e.y * e.z
            })
            .sum();
        let ge = global.extent();
        let expected = ge.x * ge.y * ge.z;
        assert!(
            (total - expected).abs() < expected * 1e-5,
            "n={n}: sub-box volumes sum to {total}, global is {expected}"
        );
    }
}
