//! Program generation, caching and slot-count degradation.

use std::collections::HashMap;

use crate::backend::{GpuBackend, ProgramHandle, ProgramSource};
use crate::error::{RenderError, RenderResult};
use crate::filter::Filter;

const BATCH_TEMPLATE: &str = include_str!("shaders/batch.wgsl");
const COVER_TEMPLATE: &str = include_str!("shaders/cover.wgsl");

const REGULAR_BODY: &str = "    return vec4<f32>(color.rgb{{premultiply}}, color.a * in.alpha);";
const UNPREMULTIPLY: &str = " / max(color.a, 0.00001)";
const BLIT_BODY: &str = "    return textureSampleLevel(src_tex, src_smp, in.uv, 0.0);";

/// Slots dropped per failed batch compile.
const DEGRADE_STEP: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ProgramKind {
    /// Multi-texture card batches.
    Regular,
    /// Full-target quads for filters and blits.
    Cover,
    /// Single-texture card batches.
    Particle,
    /// Card batches with a caller-supplied fragment body.
    Override,
}

/// Cache key. At most one program exists per key.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ProgramKey {
    pub kind: ProgramKind,
    pub slot_count: usize,
    pub premultiply: bool,
    pub custom: Option<String>,
}

impl ProgramKey {
    pub fn regular(slot_count: usize, premultiply: bool) -> Self {
        Self {
            kind: ProgramKind::Regular,
            slot_count,
            premultiply,
            custom: None,
        }
    }

    fn cover(custom: Option<String>) -> Self {
        Self {
            kind: ProgramKind::Cover,
            slot_count: 1,
            premultiply: false,
            custom,
        }
    }
}

/// Custom fragment body for card batches.
///
/// The body runs after slot selection with `color` (the sampled texel) and `in`
/// (`in.uv`, `in.alpha`) in scope, and must end in `return`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderOverride {
    pub key: String,
    pub body: String,
}

/// Generated batch program source for `count` slots.
pub fn batch_source(count: usize, premultiply: bool, body: Option<&str>) -> String {
    let count = count.max(1);
    let declarations: String = (0..count)
        .map(|i| {
            format!(
                "@group(0) @binding({}) var card_tex_{i}: texture_2d<f32>;\n",
                i + 2
            )
        })
        .collect();
    let alternates: String = (0..count)
        .map(|i| {
            let branch = if i == 0 { "if" } else { " else if" };
            format!(
                "{branch} (index == {i}u) {{\n        color = textureSampleLevel(card_tex_{i}, card_smp, uv, 0.0);\n    }}"
            )
        })
        .collect();
    let premultiply = if premultiply { UNPREMULTIPLY } else { "" };

    BATCH_TEMPLATE
        .replace("{{count}}", &count.to_string())
        .replace("{{declarations}}", &declarations)
        .replace("{{alternates}}", &alternates)
        .replace("{{body}}", body.unwrap_or(REGULAR_BODY))
        .replace("{{premultiply}}", premultiply)
}

/// Generated cover program source. `None` is a plain copy.
pub fn cover_source(body: Option<&str>) -> String {
    COVER_TEMPLATE.replace("{{body}}", body.unwrap_or(BLIT_BODY))
}

/// Compiles and caches program variants.
///
/// The batch program starts at the requested slot count. Each compile failure drops
/// it by four (never below one) and lowers a ceiling that later requests cannot
/// exceed.
#[derive(Debug)]
pub struct ShaderCompiler {
    programs: HashMap<ProgramKey, ProgramHandle>,
    slot_count: usize,
    ceiling: Option<usize>,
    premultiply: bool,
    verbose: bool,
}

impl ShaderCompiler {
    pub fn new(slot_count: usize, premultiply: bool, verbose: bool) -> Self {
        Self {
            programs: HashMap::new(),
            slot_count: slot_count.max(1),
            ceiling: None,
            premultiply,
            verbose,
        }
    }

    /// Current simultaneous texture count of the batch program.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Returns the cached program for `key` or builds it from `source`.
    fn compile_with<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        key: ProgramKey,
        source: impl FnOnce() -> String,
    ) -> RenderResult<ProgramHandle> {
        if let Some(&program) = self.programs.get(&key) {
            return Ok(program);
        }

        let label = match &key.custom {
            Some(custom) => format!("cardstock {:?} program ({custom})", key.kind),
            None => format!("cardstock {:?} program x{}", key.kind, key.slot_count),
        };
        let program = backend.compile_program(&ProgramSource {
            label,
            kind: key.kind,
            slot_count: key.slot_count,
            premultiply: key.premultiply,
            wgsl: source(),
        })?;

        log::debug!("compiled {:?} program with {} slot(s)", key.kind, key.slot_count);
        self.programs.insert(key, program);
        Ok(program)
    }

    /// Batch program at the current slot count, degrading on failure.
    pub fn regular_program<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<ProgramHandle> {
        loop {
            let count = self.slot_count;
            let premultiply = self.premultiply;
            let result = self.compile_with(backend, ProgramKey::regular(count, premultiply), || {
                batch_source(count, premultiply, None)
            });

            match result {
                Ok(program) => return Ok(program),
                Err(RenderError::ShaderCompile { log: reason, .. }) if count > 1 => {
                    let next = count.saturating_sub(DEGRADE_STEP).max(1);
                    if self.verbose {
                        log::warn!("batch program failed at {count} slots, retrying at {next}: {reason}");
                    } else {
                        log::debug!("batch program failed at {count} slots, retrying at {next}");
                    }
                    self.slot_count = next;
                    self.ceiling = Some(next);
                }
                Err(RenderError::ShaderCompile { log: reason, .. }) => {
                    return Err(RenderError::shader(count, reason));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Requests a new simultaneous texture count, clamped to `1..=max_units` and to any
    /// ceiling left by earlier failures, then compiles it.
    pub fn set_slot_count<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        requested: usize,
    ) -> RenderResult<ProgramHandle> {
        let mut count = requested.clamp(1, backend.max_texture_units().max(1));
        if let Some(ceiling) = self.ceiling {
            count = count.min(ceiling);
        }
        self.slot_count = count;
        self.regular_program(backend)
    }

    /// Single-texture batch program.
    pub fn particle_program<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<ProgramHandle> {
        let premultiply = self.premultiply;
        let key = ProgramKey {
            kind: ProgramKind::Particle,
            slot_count: 1,
            premultiply,
            custom: None,
        };
        self.compile_with(backend, key, || batch_source(1, premultiply, None))
    }

    /// Batch program at the current slot count with a custom fragment body.
    pub fn override_program<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        shader: &ShaderOverride,
    ) -> RenderResult<ProgramHandle> {
        let count = self.slot_count;
        let premultiply = self.premultiply;
        let key = ProgramKey {
            kind: ProgramKind::Override,
            slot_count: count,
            premultiply,
            custom: Some(shader.key.clone()),
        };
        self.compile_with(backend, key, || {
            batch_source(count, premultiply, Some(&shader.body))
        })
    }

    /// Cover program for `filter`, or the plain blit when `None`.
    pub fn cover_program<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        filter: Option<&dyn Filter>,
    ) -> RenderResult<ProgramHandle> {
        match filter {
            Some(filter) => {
                let key = ProgramKey::cover(Some(filter.shader_key().into_owned()));
                self.compile_with(backend, key, || cover_source(Some(&filter.fragment_body())))
            }
            None => self.compile_with(backend, ProgramKey::cover(None), || cover_source(None)),
        }
    }

    /// Deletes every cached program.
    pub fn release_all<B: GpuBackend>(&mut self, backend: &mut B) {
        for (_, program) in self.programs.drain() {
            backend.delete_program(program);
        }
    }
}
