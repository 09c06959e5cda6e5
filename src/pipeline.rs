use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DeobConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::DeobError;
use crate::extractor::extract;
use crate::fold::fold_to_fixed_point;
use crate::locator::{Locator, PatternTable};
use crate::rewriter::{DecoderBindings, Rewriter};
use crate::sandbox::{Decode, NoDecoders, Sandbox};
use crate::tree::{with_globals, SourceTree};

/// Bound on fold passes inside one cycle.
const FOLD_PASS_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// (Rewriter, Fold) cycles run, including the final one that changed nothing.
    pub cycles: usize,
    pub rewritten: usize,
    pub folded: usize,
    pub decoders: usize,
}

#[derive(Debug, Clone)]
pub struct DeobOutput {
    pub code: String,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: RunStats,
}

/// One configured deobfuscator. Holds no per-script state, so a single
/// pipeline can process any number of scripts one after another.
pub struct Pipeline {
    config: DeobConfig,
    patterns: PatternTable,
    key_pattern: Regex,
}

impl Pipeline {
    pub fn new(config: DeobConfig) -> Result<Self, DeobError> {
        config.validate()?;
        let key_pattern = config.patterns.key_regex()?;
        Ok(Self {
            config,
            patterns: PatternTable::default(),
            key_pattern,
        })
    }

    /// Replaces the default pattern table.
    pub fn with_patterns(mut self, patterns: PatternTable) -> Self {
        self.patterns = patterns;
        self
    }

    /// Deobfuscates one script. `name` only shows up in parse errors.
    ///
    /// Only a parse failure is an error. Every other problem leaves the
    /// affected part of the source as written and adds a diagnostic.
    pub fn run(&self, name: &str, source: &str) -> Result<DeobOutput, DeobError> {
        with_globals(|| self.run_script(name, source))
    }

    fn run_script(&self, name: &str, source: &str) -> Result<DeobOutput, DeobError> {
        let mut tree = SourceTree::parse(name, source)?;
        let mut diagnostics = Diagnostics::default();
        let mut stats = RunStats::default();

        let found = match Locator::new(&self.patterns, &self.config.patterns).locate(&tree.program) {
            Ok(found) => found,
            Err(err) => {
                warn!(%err, "helpers not located, leaving script untouched");
                diagnostics.push(Diagnostic::from_locate(&err));
                return Ok(DeobOutput {
                    code: source.to_string(),
                    diagnostics: diagnostics.into_vec(),
                    stats,
                });
            }
        };
        stats.decoders = found.decoders.len();

        // Evaluate the extracted helpers once; the sandbox lives until the
        // end of this run and is torn down on drop.
        let unit = extract(&found, tree.source_map());
        let sandbox = if found.decoders.is_empty() {
            debug!("no decoders found, skipping evaluation");
            None
        } else {
            match Sandbox::evaluate(&unit, &self.config.sandbox) {
                Ok(sandbox) => {
                    for (slot, err) in sandbox.unavailable() {
                        let location = found
                            .decoders
                            .get(slot)
                            .and_then(|d| tree.location(d.function.span));
                        warn!(slot, %err, "decoder unavailable");
                        diagnostics.push(Diagnostic::from_sandbox(err, location));
                    }
                    Some(sandbox)
                }
                Err(err) => {
                    warn!(%err, "sandbox evaluation failed, decoders disabled");
                    diagnostics.push(Diagnostic::from_sandbox(&err, None));
                    None
                }
            }
        };
        let decoder: &dyn Decode = match &sandbox {
            Some(sandbox) => sandbox,
            None => &NoDecoders,
        };

        let bindings = DecoderBindings::collect(
            &tree.program,
            &unit.decoder_ids,
            self.config.patterns.max_alias_depth,
        );
        let mut rewriter = Rewriter::new(bindings, decoder, self.key_pattern.clone())
            .leave_untouched(found.shuffle_unit.span);

        // Rewrite, then fold, until a whole cycle changes nothing.
        let mut settled = false;
        while stats.cycles < self.config.max_cycles {
            stats.cycles += 1;

            let pass = rewriter.run(&mut tree.program);
            for skipped in pass.skipped {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::RewriteSkipped,
                    tree.location(skipped.span),
                    skipped.message,
                ));
            }
            let folded = fold_to_fixed_point(&mut tree.program, FOLD_PASS_LIMIT);

            debug!(cycle = stats.cycles, rewritten = pass.rewritten, folded, "cycle finished");
            stats.rewritten += pass.rewritten;
            stats.folded += folded;
            if pass.rewritten + folded == 0 {
                settled = true;
                break;
            }
        }
        if !settled {
            warn!(max_cycles = self.config.max_cycles, "cycle limit reached before fixed point");
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::CycleLimitReached,
                None,
                format!(
                    "stopped after {} cycles without reaching a fixed point",
                    self.config.max_cycles
                ),
            ));
        }

        info!(
            cycles = stats.cycles,
            rewritten = stats.rewritten,
            folded = stats.folded,
            decoders = stats.decoders,
            "deobfuscation finished"
        );
        Ok(DeobOutput {
            code: tree.emit(),
            diagnostics: diagnostics.into_vec(),
            stats,
        })
    }
}

/// Deobfuscates `source` with `config`.
pub fn deobfuscate(source: &str, config: &DeobConfig) -> Result<DeobOutput, DeobError> {
    Pipeline::new(config.clone())?.run("input.js", source)
}
