use cardstock_engine::coords::{Affine, ColorRgba};
use cardstock_engine::filter::{BlurFilter, ColorFilter, ColorMatrixFilter, Filter, expand_passes};
use cardstock_engine::{
    CacheDescriptor, ImageSource, Leaf, NodeId, RenderError, Renderer, RendererConfig,
    SoftwareBackend,
};
use image::{Rgba, RgbaImage};

fn solid(w: u32, h: u32, color: [u8; 4]) -> ImageSource {
    ImageSource::new(RgbaImage::from_pixel(w, h, Rgba(color)))
}

fn renderer(config: RendererConfig) -> Renderer<SoftwareBackend> {
    Renderer::new(SoftwareBackend::new(32, 32), config).unwrap()
}

fn no_auto_purge() -> RendererConfig {
    RendererConfig {
        auto_purge_interval_frames: None,
        ..Default::default()
    }
}

fn max_channel_diff(a: &RgbaImage, b: &RgbaImage) -> u8 {
    assert_eq!(a.dimensions(), b.dimensions());
    a.as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| x.abs_diff(*y))
        .max()
        .unwrap_or(0)
}

// ── batching ──────────────────────────────────────────────────────────────

#[test]
fn identical_texture_quads_split_only_by_card_limit() {
    let src = solid(2, 2, [255, 255, 255, 255]);
    for (n, m) in [(1usize, 1usize), (10, 10), (25, 10), (7, 3)] {
        let mut r = renderer(RendererConfig {
            max_cards_per_batch: m,
            ..no_auto_purge()
        });
        let leaves: Vec<Leaf> = (0..n)
            .map(|i| Leaf::bitmap(&src, Affine::translation(i as f32, 0.0)))
            .collect();
        r.draw_frame(&leaves).unwrap();

        assert_eq!(r.stats().draw_calls, n.div_ceil(m), "n={n} m={m}");
        assert_eq!(r.stats().texture_overflows, 0);
        assert_eq!(r.stats().cards, n);
    }
}

#[test]
fn shared_source_uses_one_entry_and_one_slot() {
    let mut r = renderer(no_auto_purge());
    let src = solid(2, 2, [10, 20, 30, 255]);
    r.draw_frame(&[
        Leaf::bitmap(&src, Affine::IDENTITY),
        Leaf::bitmap(&src, Affine::translation(4.0, 4.0)),
    ])
    .unwrap();

    assert_eq!(r.texture_count(), 1);
    let id = r.texture_for(&src).unwrap();
    assert!(r.texture_slot(id).is_some());
    assert_eq!(r.stats().draw_calls, 1);
}

#[test]
fn shared_texture_alias_draws_from_existing_upload() {
    let mut r = renderer(no_auto_purge());
    let original = solid(2, 2, [0, 0, 255, 255]);
    let alias = solid(2, 2, [255, 0, 0, 255]);
    let id = r.share_texture(&original, &alias).unwrap();
    assert_eq!(r.texture_for(&alias), Some(id));

    r.draw_frame(&[Leaf::bitmap(&alias, Affine::IDENTITY)]).unwrap();
    assert_eq!(r.texture_count(), 1);
    assert_eq!(r.backend().surface_image().get_pixel(0, 0).0, [0, 0, 255, 255]);
}

#[test]
fn sharing_mid_frame_keeps_cards_already_queued() {
    let mut r = renderer(transparent());
    let green = solid(2, 2, [0, 255, 0, 255]);
    let blue = solid(2, 2, [0, 0, 255, 255]);

    r.begin_frame().unwrap();
    r.append_leaf(&Leaf::bitmap(&green, Affine::IDENTITY)).unwrap();
    r.share_texture(&blue, &green).unwrap();
    r.end_frame().unwrap();
    assert_eq!(r.backend().surface_image().get_pixel(0, 0).0, [0, 255, 0, 255]);

    // Later frames draw the alias from the shared texture.
    r.draw_frame(&[Leaf::bitmap(&green, Affine::IDENTITY)]).unwrap();
    assert_eq!(r.backend().surface_image().get_pixel(0, 0).0, [0, 0, 255, 255]);
}

#[test]
fn three_bitmaps_two_images_split_by_card_count() {
    let mut r = renderer(RendererConfig {
        max_cards_per_batch: 2,
        batch_texture_count: 8,
        ..no_auto_purge()
    });
    let x = solid(2, 2, [255, 0, 0, 255]);
    let y = solid(2, 2, [0, 255, 0, 255]);
    r.draw_frame(&[
        Leaf::bitmap(&x, Affine::IDENTITY),
        Leaf::bitmap(&x, Affine::translation(2.0, 0.0)),
        Leaf::bitmap(&y, Affine::translation(4.0, 0.0)),
    ])
    .unwrap();

    assert_eq!(r.texture_count(), 2);
    assert_eq!(r.stats().draw_calls, 2);
    assert_eq!(r.stats().vertex_overflows, 1);
    assert_eq!(r.stats().texture_overflows, 0);
}

#[test]
fn more_textures_than_slots_flushes_on_overflow() {
    let mut r = renderer(RendererConfig {
        batch_texture_count: 2,
        ..no_auto_purge()
    });
    let sources: Vec<ImageSource> = (0..3u8).map(|i| solid(1, 1, [i * 80, 0, 0, 255])).collect();
    let leaves: Vec<Leaf> = sources
        .iter()
        .enumerate()
        .map(|(i, s)| Leaf::bitmap(s, Affine::translation(i as f32, 0.0)))
        .collect();
    r.draw_frame(&leaves).unwrap();

    assert_eq!(r.slot_count(), 2);
    assert_eq!(r.stats().draw_calls, 2);
    assert_eq!(r.stats().texture_overflows, 1);
    let shown = r.backend().surface_image();
    assert_eq!(shown.get_pixel(0, 0).0, [0, 0, 0, 255]);
    assert_eq!(shown.get_pixel(2, 0).0, [160, 0, 0, 255]);
}

// ── texture lifetime ──────────────────────────────────────────────────────

#[test]
fn purge_removes_only_textures_older_than_max_age() {
    let mut r = renderer(no_auto_purge());
    let stale = solid(1, 1, [1, 1, 1, 255]);
    let fresh = solid(1, 1, [2, 2, 2, 255]);

    r.draw_frame(&[Leaf::bitmap(&stale, Affine::IDENTITY)]).unwrap();
    for _ in 0..3 {
        r.draw_frame(&[Leaf::bitmap(&fresh, Affine::IDENTITY)]).unwrap();
    }
    // Frame 4: `stale` was drawn at frame 1, exactly 3 frames behind.
    assert_eq!(r.purge_textures(3), 0);

    r.draw_frame(&[Leaf::bitmap(&fresh, Affine::IDENTITY)]).unwrap();
    assert_eq!(r.purge_textures(3), 1);
    assert!(r.texture_for(&stale).is_none());
    assert!(r.texture_for(&fresh).is_some());

    // Drawn this frame: kept even at age limit 0.
    assert_eq!(r.purge_textures(0), 0);
}

#[test]
fn purge_skips_textures_in_protected_slots() {
    let mut r = renderer(no_auto_purge());
    let keep = solid(1, 1, [9, 9, 9, 255]);
    r.draw_frame(&[Leaf::bitmap(&keep, Affine::IDENTITY)]).unwrap();
    let id = r.texture_for(&keep).unwrap();
    let slot = r.texture_slot(id).unwrap();
    r.protect_texture_slot(slot, true).unwrap();

    for _ in 0..5 {
        r.draw_frame(&[]).unwrap();
    }
    assert_eq!(r.purge_textures(1), 0);

    r.protect_texture_slot(slot, false).unwrap();
    assert_eq!(r.purge_textures(1), 1);
}

#[test]
fn released_texture_is_reuploaded_on_next_draw() {
    let mut r = renderer(no_auto_purge());
    let src = solid(1, 1, [5, 6, 7, 255]);
    r.draw_frame(&[Leaf::bitmap(&src, Affine::IDENTITY)]).unwrap();
    assert!(r.release_texture(&src).unwrap());
    assert!(!r.release_texture(&src).unwrap());
    assert_eq!(r.texture_count(), 0);

    r.draw_frame(&[Leaf::bitmap(&src, Affine::IDENTITY)]).unwrap();
    assert_eq!(r.texture_count(), 1);
    assert_eq!(r.backend().surface_image().get_pixel(0, 0).0, [5, 6, 7, 255]);
}

#[test]
fn protecting_slot_outside_device_range_is_rejected() {
    let mut r = Renderer::new(
        SoftwareBackend::new(4, 4).with_texture_units(16),
        no_auto_purge(),
    )
    .unwrap();
    assert!(matches!(
        r.protect_texture_slot(16, true),
        Err(RenderError::InvalidConfiguration(_))
    ));
    r.protect_texture_slot(15, true).unwrap();
}

// ── program degradation ───────────────────────────────────────────────────

#[test]
fn compile_failures_degrade_by_four_and_never_climb_back() {
    let mut backend = SoftwareBackend::new(4, 4);
    backend.fail_compile_above(Some(4));
    let mut r = Renderer::new(
        backend,
        RendererConfig {
            batch_texture_count: 12,
            ..no_auto_purge()
        },
    )
    .unwrap();

    assert_eq!(r.slot_count(), 4);
    assert_eq!(r.backend().compile_attempts(), &[12, 8, 4]);

    assert_eq!(r.update_simultaneous_texture_count(16).unwrap(), 4);
    assert_eq!(r.backend().compile_attempts(), &[12, 8, 4]);
}

#[test]
fn compile_failure_at_one_slot_is_fatal() {
    let mut backend = SoftwareBackend::new(4, 4);
    backend.fail_compile_above(Some(0));
    let err = Renderer::new(
        backend,
        RendererConfig {
            batch_texture_count: 6,
            ..no_auto_purge()
        },
    )
    .err()
    .unwrap();
    assert!(matches!(err, RenderError::ShaderCompile { slot_count: 1, .. }));
}

#[test]
fn requested_slots_clamp_to_device_units() {
    let r = Renderer::new(
        SoftwareBackend::new(4, 4).with_texture_units(4),
        RendererConfig {
            batch_texture_count: 32,
            ..no_auto_purge()
        },
    )
    .unwrap();
    assert_eq!(r.slot_count(), 4);
}

// ── caching and filters ───────────────────────────────────────────────────

#[test]
fn blurred_cache_sizes_target_with_bleed() {
    let mut r = renderer(no_auto_purge());
    let src = solid(100, 100, [200, 200, 200, 255]);
    let blur = BlurFilter::new(4, 4);
    let out = r
        .cache_draw(
            NodeId(1),
            &[Leaf::bitmap(&src, Affine::IDENTITY)],
            &[&blur],
            &CacheDescriptor::new(0.0, 0.0, 100.0, 100.0).with_scale(2.0),
        )
        .unwrap();

    assert_eq!((out.size.width, out.size.height), (210, 210));
    assert_eq!(r.target_count(NodeId(1)), 2);
    let texture = out.texture.unwrap();
    let size = r.texture_size(texture).unwrap();
    assert_eq!((size.width, size.height), (210, 210));
}

fn gradient_node() -> ImageSource {
    ImageSource::new(RgbaImage::from_fn(4, 4, |x, y| {
        Rgba([(x * 60) as u8, (y * 60) as u8, 128, 255])
    }))
}

fn cached_frame(gpu_filters: bool, src: &ImageSource, filters: &[&dyn Filter]) -> RgbaImage {
    let mut r = Renderer::new(
        SoftwareBackend::new(4, 4),
        RendererConfig {
            gpu_filters,
            ..no_auto_purge()
        },
    )
    .unwrap();
    let out = r
        .cache_draw(
            NodeId(3),
            &[Leaf::bitmap(src, Affine::IDENTITY)],
            filters,
            &CacheDescriptor::new(0.0, 0.0, 4.0, 4.0),
        )
        .unwrap();
    r.draw_frame(&[out.leaf(Affine::IDENTITY).unwrap()]).unwrap();
    r.backend().surface_image()
}

#[test]
fn gpu_filter_chain_matches_cpu_reference() {
    let src = gradient_node();
    let gray = ColorMatrixFilter::grayscale();
    let tint = ColorFilter::new([0.5, 1.0, 1.0, 1.0], [20.0, 0.0, 0.0, 0.0]);
    let filters: [&dyn Filter; 2] = [&gray, &tint];

    let mut reference = src.snapshot().unwrap();
    for pass in expand_passes(&filters) {
        assert!(pass.apply_pixels(&mut reference));
    }

    let gpu = cached_frame(true, &src, &filters);
    let cpu = cached_frame(false, &src, &filters);
    assert!(max_channel_diff(&gpu, &reference) <= 2);
    assert!(max_channel_diff(&cpu, &reference) <= 2);
}

#[test]
fn unfiltered_cache_is_upright() {
    let src = gradient_node();
    let shown = cached_frame(true, &src, &[]);
    let expected = src.snapshot().unwrap();
    assert_eq!(max_channel_diff(&shown, &expected), 0);
}

fn transparent() -> RendererConfig {
    RendererConfig {
        transparent: true,
        ..no_auto_purge()
    }
}

/// Draws `leaf` alone on a transparent surface and returns the top-left pixel.
fn shown_pixel(r: &mut Renderer<SoftwareBackend>, leaf: Leaf) -> [u8; 4] {
    r.draw_frame(&[leaf]).unwrap();
    r.backend().surface_image().get_pixel(0, 0).0
}

#[test]
fn semi_transparent_cache_draws_like_its_source() {
    let src = solid(2, 2, [255, 0, 0, 128]);
    let desc = CacheDescriptor::new(0.0, 0.0, 2.0, 2.0);
    for gpu_filters in [true, false] {
        let mut r = renderer(RendererConfig {
            gpu_filters,
            ..transparent()
        });
        let direct = shown_pixel(&mut r, Leaf::bitmap(&src, Affine::IDENTITY));
        assert_eq!(direct, [128, 0, 0, 128]);

        let out = r
            .cache_draw(NodeId(1), &[Leaf::bitmap(&src, Affine::IDENTITY)], &[], &desc)
            .unwrap();
        let cached = shown_pixel(&mut r, out.leaf(Affine::IDENTITY).unwrap());
        assert_eq!(cached, direct, "gpu_filters={gpu_filters}");
    }
}

#[test]
fn faded_cache_matches_drawing_at_half_alpha() {
    let src = solid(2, 2, [200, 0, 0, 255]);
    let fade = ColorFilter::fade(0.5);
    let desc = CacheDescriptor::new(0.0, 0.0, 2.0, 2.0);
    for gpu_filters in [true, false] {
        let mut r = renderer(RendererConfig {
            gpu_filters,
            ..transparent()
        });
        let direct = shown_pixel(&mut r, Leaf::bitmap(&src, Affine::IDENTITY).with_alpha(0.5));
        assert_eq!(direct, [100, 0, 0, 128]);

        let out = r
            .cache_draw(NodeId(1), &[Leaf::bitmap(&src, Affine::IDENTITY)], &[&fade], &desc)
            .unwrap();
        let cached = shown_pixel(&mut r, out.leaf(Affine::IDENTITY).unwrap());
        assert_eq!(cached, direct, "gpu_filters={gpu_filters}");
    }
}

#[test]
fn self_managed_cache_draws_to_surface() {
    let mut r = Renderer::new(SoftwareBackend::new(4, 4), no_auto_purge()).unwrap();
    let src = gradient_node();
    let tint = ColorFilter::fade(1.0);
    let out = r
        .cache_draw(
            NodeId(4),
            &[Leaf::bitmap(&src, Affine::IDENTITY)],
            &[&tint],
            &CacheDescriptor::new(0.0, 0.0, 4.0, 4.0).self_managed(),
        )
        .unwrap();
    assert!(out.texture.is_none());
    let expected = src.snapshot().unwrap();
    assert_eq!(max_channel_diff(&r.backend().surface_image(), &expected), 0);
}

#[test]
fn failed_cache_allocation_leaves_other_caches_intact() {
    let mut r = renderer(no_auto_purge());
    let src = solid(4, 4, [0, 200, 0, 255]);
    let leaves = [Leaf::bitmap(&src, Affine::IDENTITY)];
    let blur = BlurFilter::new(2, 2);
    let desc = CacheDescriptor::new(0.0, 0.0, 4.0, 4.0);

    let first = r.cache_draw(NodeId(1), &leaves, &[&blur], &desc).unwrap();
    assert_eq!(r.target_count(NodeId(1)), 2);

    let live = r.backend().live_textures();
    r.backend_mut().set_texture_budget(Some(live));
    let err = r.cache_draw(NodeId(2), &leaves, &[&blur], &desc).unwrap_err();
    assert!(matches!(err, RenderError::ResourceExhaustion(_)));
    assert_eq!(r.target_count(NodeId(2)), 0);
    assert_eq!(r.backend().live_textures(), live);

    assert_eq!(r.target_count(NodeId(1)), 2);
    r.backend_mut().set_texture_budget(None);
    r.reset_stats();
    r.draw_frame(&[first.leaf(Affine::IDENTITY).unwrap()]).unwrap();
    assert_eq!(r.stats().draw_calls, 1);
}

#[test]
fn restricted_pixels_skip_cpu_filters_unless_strict() {
    let src = solid(2, 2, [100, 100, 100, 255]).restricted();
    let half = ColorFilter::new([0.5, 0.5, 0.5, 1.0], [0.0; 4]);
    let desc = CacheDescriptor::new(0.0, 0.0, 2.0, 2.0);
    let leaves = [Leaf::bitmap(&src, Affine::IDENTITY)];

    let mut lenient = renderer(RendererConfig {
        gpu_filters: false,
        ..no_auto_purge()
    });
    let out = lenient
        .cache_draw(NodeId(1), &leaves, &[&half], &desc)
        .unwrap();
    assert!(out.texture.is_some());

    let mut strict = renderer(RendererConfig {
        gpu_filters: false,
        strict_readback: true,
        ..no_auto_purge()
    });
    let err = strict
        .cache_draw(NodeId(1), &leaves, &[&half], &desc)
        .unwrap_err();
    assert!(matches!(err, RenderError::SecurityRestriction(_)));
    assert_eq!(strict.target_count(NodeId(1)), 0);

    // GPU chains never read pixels back.
    let mut gpu = renderer(no_auto_purge());
    gpu.cache_draw(NodeId(1), &leaves, &[&half], &desc).unwrap();
}

#[test]
fn uncache_releases_both_targets() {
    let mut r = renderer(no_auto_purge());
    let src = solid(2, 2, [1, 2, 3, 255]);
    let blur = BlurFilter::new(2, 2);
    r.cache_draw(
        NodeId(8),
        &[Leaf::bitmap(&src, Affine::IDENTITY)],
        &[&blur],
        &CacheDescriptor::new(0.0, 0.0, 2.0, 2.0),
    )
    .unwrap();
    assert!(r.uncache(NodeId(8)).unwrap());
    assert_eq!(r.target_count(NodeId(8)), 0);
    assert!(!r.uncache(NodeId(8)).unwrap());
}

// ── surface state ─────────────────────────────────────────────────────────

#[test]
fn clear_color_fills_surface() {
    let mut r = renderer(no_auto_purge());
    r.set_clear_color_u32(0x336699ff);
    r.draw_frame(&[]).unwrap();
    assert_eq!(r.backend().surface_image().get_pixel(5, 5).0, [0x33, 0x66, 0x99, 0xff]);

    r.set_clear_color_str("#ff0000").unwrap();
    assert_eq!(r.clear_color(), ColorRgba::new(1.0, 0.0, 0.0, 1.0));
    assert!(r.set_clear_color_str("not a color").is_err());
}

#[test]
fn transparent_config_clears_to_transparent() {
    let mut r = renderer(RendererConfig {
        transparent: true,
        ..no_auto_purge()
    });
    r.draw_frame(&[]).unwrap();
    assert_eq!(r.backend().surface_image().get_pixel(0, 0).0, [0, 0, 0, 0]);
}
