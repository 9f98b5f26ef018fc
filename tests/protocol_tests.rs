//! Wire protocol tests
//!
//! Tests for:
//! - Commit-envelope round trips for every keyed object class
//! - Ray-list wire form fidelity
//! - Pixel message packing
//! - Frame encode/decode over the byte-stream framing

use glam::Vec3;
use nebula::camera::Camera;
use nebula::comm::{Frame, MessageClass, Pixel, pack_pixels, unpack_pixels};
use nebula::datasets::{DataKind, Datasets};
use nebula::geometry::Box3;
use nebula::lighting::{LightSource, Lighting};
use nebula::partition::PartitionMeta;
use nebula::rays::{Classification, RayList, RayListKind, RayType, TermFlags};
use nebula::registry::{CommitBody, CommitEnvelope};
use nebula::renderer::{RendererConfig, RendererKind};
use nebula::rendering::{RenderingMeta, RenderingSetMeta};
use nebula::vis::{ColorControl, OpacityControl, Vis, VisParams, Visualization};

fn round_trip(env: &CommitEnvelope) -> CommitEnvelope {
    let bytes = serde_json::to_vec(env).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Keyed-object commit round trips
// ============================================================================

#[test]
fn camera_commit_round_trip() {
    let env = CommitEnvelope {
        key: 11,
        body: CommitBody::Camera(Camera {
            eye: Vec3::new(1.0, 2.0, 3.0),
            view_dir: Vec3::new(0.0, 0.0, -1.0),
            view_up: Vec3::Y,
            aov: 35.0,
            width: 1920,
            height: 1080,
            annotation: "_cam0".into(),
        }),
    };
    let back = round_trip(&env);
    assert_eq!(back.key, 11);
    match (&env.body, &back.body) {
        (CommitBody::Camera(a), CommitBody::Camera(b)) => assert_eq!(a, b),
        _ => panic!("class changed in flight"),
    }
}

#[test]
fn visualization_commit_round_trip() {
    let vis = Visualization {
        annotation: "_v".into(),
        elements: vec![
            Vis {
                dataset_key: 5,
                params: VisParams::Volume {
                    colormap: vec![ColorControl { value: 0.0, color: [0.1, 0.2, 0.3] }],
                    opacitymap: vec![OpacityControl { value: 0.5, opacity: 0.7 }],
                    volume_rendering: true,
                    isovalues: vec![0.25, 0.75],
                    slices: vec![[0.0, 0.0, 1.0, 0.5]],
                },
            },
            Vis {
                dataset_key: 6,
                params: VisParams::Particles {
                    radius_map: nebula::vis::RadiusMap {
                        value0: 0.0,
                        value1: 1.0,
                        radius0: 0.01,
                        radius1: 0.1,
                    },
                },
            },
        ],
        lighting: Lighting {
            lights: vec![
                LightSource::Point(Vec3::new(2.0, 2.0, 2.0)),
                LightSource::CameraRelative(Vec3::new(0.5, 0.5, 0.0)),
            ],
            ao_count: 8,
            ao_radius: 0.5,
            ka: 0.3,
            kd: 0.7,
            shadows: true,
        },
    };
    let env = CommitEnvelope {
        key: 12,
        body: CommitBody::Visualization(vis),
    };
    let back = round_trip(&env);
    match (&env.body, &back.body) {
        (CommitBody::Visualization(a), CommitBody::Visualization(b)) => assert_eq!(a, b),
        _ => panic!("class changed in flight"),
    }
}

#[test]
fn structural_round_trip_for_remaining_classes() {
    let mut catalog = Datasets::new();
    catalog.insert("density", 3, DataKind::Volume);
    catalog.insert("tracks", 4, DataKind::PathLines);

    let bodies = vec![
        CommitBody::Datasets(catalog),
        CommitBody::Partition(PartitionMeta {
            global_box: Box3::new(Vec3::splat(-2.0), Vec3::splat(2.0)),
            n_partitions: 8,
        }),
        CommitBody::Rendering(RenderingMeta {
            owner: 3,
            width: 640,
            height: 480,
            camera_key: 11,
            visualization_key: 12,
            datasets_key: 13,
        }),
        CommitBody::RenderingSet(RenderingSetMeta {
            rendering_keys: vec![21, 22, 23],
        }),
        CommitBody::Renderer(RendererConfig {
            kind: RendererKind::Schlieren,
            max_rays_per_list: 5000,
            epsilon: 2e-4,
            fuzz: 1e-5,
            permute_pixels: true,
            step_limit: 5000,
        }),
    ];

    for (i, body) in bodies.into_iter().enumerate() {
        let env = CommitEnvelope {
            key: 100 + i as u64,
            body,
        };
        let back = round_trip(&env);
        let a = serde_json::to_value(&env).unwrap();
        let b = serde_json::to_value(&back).unwrap();
        assert_eq!(a, b, "envelope {i} drifted through serialization");
    }
}

// ============================================================================
// Ray lists on the wire
// ============================================================================

#[test]
fn ray_list_wire_form_is_faithful() {
    let mut list = RayList::new(7, 8, 9, 37, 4, RayListKind::Secondary);
    for i in 0..37 {
        let f = i as f32;
        list.set_origin(i, Vec3::new(f, -f, f * 0.5));
        list.set_dir(i, Vec3::new(0.0, 1.0, 0.0));
        list.set_normal(i, Vec3::X);
        list.set_sample(i, f * 0.25);
        list.set_color(i, [f, f + 0.1, f + 0.2, 0.5]);
        list.set_surface_color(i, [0.9, 0.8, 0.7, 0.6]);
        list.set_t(i, f * 2.0);
        list.set_t_max(i, 100.0 + f);
        list.set_pixel(i, i as i32, (i * 3) as i32);
        list.set_ray_type(i, RayType::Ao);
        list.set_term(i, TermFlags::SURFACE | TermFlags::BOUNDARY);
        list.set_classification(i, Classification::Send(i % 4));
    }

    let wire = list.to_wire();
    // Header + 25 lanes of aligned (48) entries
    assert_eq!(wire.len(), 64 + 48 * 25 * 4);

    let back = RayList::from_wire(&wire).unwrap();
    assert_eq!(back.len(), 37);
    assert_eq!(back.kind(), RayListKind::Secondary);
    assert_eq!(back.frame(), 4);
    assert_eq!(back.renderer_key(), 7);
    assert_eq!(back.set_key(), 8);
    assert_eq!(back.rendering_key(), 9);
    for i in [0usize, 13, 36] {
        assert_eq!(back.origin(i), list.origin(i));
        assert_eq!(back.sample(i), list.sample(i));
        assert_eq!(back.color(i), list.color(i));
        assert_eq!(back.surface_color(i), list.surface_color(i));
        assert_eq!(back.t_max(i), list.t_max(i));
        assert_eq!(back.pixel(i), list.pixel(i));
        assert_eq!(back.ray_type(i), list.ray_type(i));
        assert_eq!(back.term(i), list.term(i));
        assert_eq!(back.classification(i), list.classification(i));
    }
}

// ============================================================================
// Pixels and frames
// ============================================================================

#[test]
fn pixel_message_survives_framing() {
    let pixels: Vec<Pixel> = (0..9)
        .map(|i| Pixel {
            x: i,
            y: i * 2,
            r: i as f32 * 0.1,
            g: 0.5,
            b: 1.0 - i as f32 * 0.1,
            o: 1.0,
        })
        .collect();

    let payload = pack_pixels(41, 42, 6, 3, &pixels);
    let frame = Frame::new(MessageClass::SendPixels, payload);
    let decoded = Frame::decode(&frame.encode()).unwrap();
    assert_eq!(decoded.class, MessageClass::SendPixels);

    let (hdr, body) = unpack_pixels(&decoded.payload).unwrap();
    assert_eq!(hdr.rendering_key, 41);
    assert_eq!(hdr.set_key, 42);
    assert_eq!(hdr.frame, 6);
    assert_eq!(hdr.source, 3);
    assert_eq!(body, pixels);
}
