//! Audit reason codes and retry actions
//!
//! Reason codes are a closed set. Anything the auditor reports that is not in
//! the table becomes [`ReasonCode::Unclassified`] with a warning, so an
//! unknown code can never silently skip the retry ladder.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, warn};

/// Failure reason reported by the audit collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReasonCode {
    #[serde(rename = "HF01_FORMAT_MISMATCH")]
    FormatMismatch,
    #[serde(rename = "HF01_WIDTH_MISMATCH")]
    WidthMismatch,
    #[serde(rename = "HF01_HEIGHT_MISMATCH")]
    HeightMismatch,
    #[serde(rename = "HF01_NO_ALPHA")]
    NoAlpha,
    #[serde(rename = "HF02_OPAQUE_BACKGROUND")]
    OpaqueBackground,
    #[serde(rename = "HF02_BACKGROUND_LEAK")]
    BackgroundLeak,
    #[serde(rename = "HF02_EXCESSIVE_HALO")]
    ExcessiveHalo,
    #[serde(rename = "HF03_BASELINE_DRIFT")]
    BaselineDrift,
    #[serde(rename = "HF05_EXTRA_LIMBS")]
    ExtraLimbs,
    #[serde(rename = "HF05_MISSING_LIMBS")]
    MissingLimbs,
    #[serde(rename = "HF05_WRONG_OUTFIT")]
    WrongOutfit,
    #[serde(rename = "HF05_IDENTITY_BREAK")]
    IdentityBreak,
    #[serde(rename = "SF01_IDENTITY_DRIFT")]
    IdentityDrift,
    #[serde(rename = "SF02_PALETTE_DRIFT")]
    PaletteDrift,
    #[serde(rename = "SF03_LINE_DRIFT")]
    LineDrift,
    #[serde(rename = "SF03_BLUR_DETECTED")]
    BlurDetected,
    #[serde(rename = "SF04_TEMPORAL_FLICKER")]
    TemporalFlicker,
    #[serde(rename = "SF05_HALO_DETECTED")]
    HaloDetected,
    #[serde(rename = "SF05_FRINGE_DETECTED")]
    FringeDetected,
    /// Generation collaborator produced no candidate
    #[serde(rename = "GENERATION_FAILED")]
    GenerationFailed,
    /// Audit collaborator could not produce a verdict
    #[serde(rename = "AUDIT_ERROR")]
    AuditError,
    /// Auditor reported a code outside the table (or no code at all)
    #[serde(rename = "UNCLASSIFIED")]
    Unclassified,
}

impl ReasonCode {
    /// Every known code, in table order
    pub const ALL: [ReasonCode; 22] = [
        ReasonCode::FormatMismatch,
        ReasonCode::WidthMismatch,
        ReasonCode::HeightMismatch,
        ReasonCode::NoAlpha,
        ReasonCode::OpaqueBackground,
        ReasonCode::BackgroundLeak,
        ReasonCode::ExcessiveHalo,
        ReasonCode::BaselineDrift,
        ReasonCode::ExtraLimbs,
        ReasonCode::MissingLimbs,
        ReasonCode::WrongOutfit,
        ReasonCode::IdentityBreak,
        ReasonCode::IdentityDrift,
        ReasonCode::PaletteDrift,
        ReasonCode::LineDrift,
        ReasonCode::BlurDetected,
        ReasonCode::TemporalFlicker,
        ReasonCode::HaloDetected,
        ReasonCode::FringeDetected,
        ReasonCode::GenerationFailed,
        ReasonCode::AuditError,
        ReasonCode::Unclassified,
    ];

    /// Wire name of the code
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::FormatMismatch => "HF01_FORMAT_MISMATCH",
            ReasonCode::WidthMismatch => "HF01_WIDTH_MISMATCH",
            ReasonCode::HeightMismatch => "HF01_HEIGHT_MISMATCH",
            ReasonCode::NoAlpha => "HF01_NO_ALPHA",
            ReasonCode::OpaqueBackground => "HF02_OPAQUE_BACKGROUND",
            ReasonCode::BackgroundLeak => "HF02_BACKGROUND_LEAK",
            ReasonCode::ExcessiveHalo => "HF02_EXCESSIVE_HALO",
            ReasonCode::BaselineDrift => "HF03_BASELINE_DRIFT",
            ReasonCode::ExtraLimbs => "HF05_EXTRA_LIMBS",
            ReasonCode::MissingLimbs => "HF05_MISSING_LIMBS",
            ReasonCode::WrongOutfit => "HF05_WRONG_OUTFIT",
            ReasonCode::IdentityBreak => "HF05_IDENTITY_BREAK",
            ReasonCode::IdentityDrift => "SF01_IDENTITY_DRIFT",
            ReasonCode::PaletteDrift => "SF02_PALETTE_DRIFT",
            ReasonCode::LineDrift => "SF03_LINE_DRIFT",
            ReasonCode::BlurDetected => "SF03_BLUR_DETECTED",
            ReasonCode::TemporalFlicker => "SF04_TEMPORAL_FLICKER",
            ReasonCode::HaloDetected => "SF05_HALO_DETECTED",
            ReasonCode::FringeDetected => "SF05_FRINGE_DETECTED",
            ReasonCode::GenerationFailed => "GENERATION_FAILED",
            ReasonCode::AuditError => "AUDIT_ERROR",
            ReasonCode::Unclassified => "UNCLASSIFIED",
        }
    }

    /// Hard gates reject a candidate outright; everything else is a soft fail
    pub fn is_hard_gate(self) -> bool {
        matches!(
            self,
            ReasonCode::FormatMismatch
                | ReasonCode::WidthMismatch
                | ReasonCode::HeightMismatch
                | ReasonCode::NoAlpha
                | ReasonCode::OpaqueBackground
                | ReasonCode::BackgroundLeak
                | ReasonCode::ExcessiveHalo
                | ReasonCode::BaselineDrift
                | ReasonCode::ExtraLimbs
                | ReasonCode::MissingLimbs
                | ReasonCode::WrongOutfit
                | ReasonCode::IdentityBreak
                | ReasonCode::GenerationFailed
                | ReasonCode::AuditError
        )
    }

    /// What the auditor saw
    pub fn description(self) -> &'static str {
        match self {
            ReasonCode::FormatMismatch => "PNG format or channel mismatch",
            ReasonCode::WidthMismatch => "Frame width differs from the baseline width",
            ReasonCode::HeightMismatch => "Frame height differs from the baseline height",
            ReasonCode::NoAlpha => "No RGBA channels (missing alpha)",
            ReasonCode::OpaqueBackground => "Background is not transparent",
            ReasonCode::BackgroundLeak => "Non-transparent pixels above 5% outside the silhouette",
            ReasonCode::ExcessiveHalo => "Semi-transparent halo above 5% of edge pixels",
            ReasonCode::BaselineDrift => "Baseline variance above 1px across frames",
            ReasonCode::ExtraLimbs => "Candidate has extra limbs compared to the baseline",
            ReasonCode::MissingLimbs => "Candidate is missing limbs compared to the baseline",
            ReasonCode::WrongOutfit => "Outfit, hair or face differs from the baseline",
            ReasonCode::IdentityBreak => "Major silhouette deviation from the baseline",
            ReasonCode::IdentityDrift => "Identity similarity below the soft floor",
            ReasonCode::PaletteDrift => "Palette match below 90%",
            ReasonCode::LineDrift => "Line weight drift above 15%",
            ReasonCode::BlurDetected => "Blur detected via edge map",
            ReasonCode::TemporalFlicker => "Frame-to-frame similarity below the coherence floor",
            ReasonCode::HaloDetected => "Semi-transparent halo around the silhouette",
            ReasonCode::FringeDetected => "Fringe severity above 0.1",
            ReasonCode::GenerationFailed => "Generation produced no candidate",
            ReasonCode::AuditError => "Audit could not evaluate the candidate",
            ReasonCode::Unclassified => "Failure reported without a recognized reason code",
        }
    }

    /// Suggested knob adjustment for an operator
    pub fn remediation(self) -> &'static str {
        match self {
            ReasonCode::FormatMismatch => "Lock canvas size and output format",
            ReasonCode::WidthMismatch => "Lock canvas width",
            ReasonCode::HeightMismatch => "Lock canvas height",
            ReasonCode::NoAlpha => "Enable RGBA output",
            ReasonCode::OpaqueBackground => "Add 'transparent background' to the prompt",
            ReasonCode::BackgroundLeak => "Add 'no background' to the negative prompt",
            ReasonCode::ExcessiveHalo => "Clean up the halo with an alpha threshold",
            ReasonCode::BaselineDrift => "Enforce a consistent pivot in generation",
            ReasonCode::ExtraLimbs => "Run a face/hand inpaint pass",
            ReasonCode::MissingLimbs => "Increase reference strength",
            ReasonCode::WrongOutfit => "Raise the reference/identity conditioning weight",
            ReasonCode::IdentityBreak => "Increase reference strength and lower denoise",
            ReasonCode::IdentityDrift => "Lower denoise (0.7 to 0.5) and raise the reference weight",
            ReasonCode::PaletteDrift => "Lock the palette explicitly and quantize in post",
            ReasonCode::LineDrift => "Add 'crisp pixel edges, no blur' to the prompt",
            ReasonCode::BlurDetected => "Add anti-aliasing negatives and use nearest-neighbor downscale",
            ReasonCode::TemporalFlicker => "Chain from the previous frame as reference",
            ReasonCode::HaloDetected => "Enable border artifact reduction when packing",
            ReasonCode::FringeDetected => "Adjust background removal and re-export with padding",
            ReasonCode::GenerationFailed => "Check the generator command, its logs and its timeout",
            ReasonCode::AuditError => "Check the auditor command and that it prints a JSON verdict",
            ReasonCode::Unclassified => "Map the auditor's codes onto the known reason codes",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        ReasonCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == wanted)
            .ok_or_else(|| format!("unknown reason code: {}", s))
    }
}

/// Convert raw auditor codes into the closed set
///
/// Unknown strings become `Unclassified` and are logged.
pub fn classify_reason_codes(raw: &[String]) -> Vec<ReasonCode> {
    debug!(count = raw.len(), "classify_reason_codes: called");
    let mut codes = Vec::with_capacity(raw.len());
    for s in raw {
        let code = match s.parse::<ReasonCode>() {
            Ok(code) => code,
            Err(_) => {
                warn!(raw = %s, "classify_reason_codes: unrecognized reason code, treating as UNCLASSIFIED");
                ReasonCode::Unclassified
            }
        };
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

/// Reason that drives the retry ladder for a failed attempt
///
/// First hard gate wins, then the first code, then `Unclassified`.
pub fn primary_reason(codes: &[ReasonCode]) -> ReasonCode {
    codes
        .iter()
        .copied()
        .find(|c| c.is_hard_gate())
        .or_else(|| codes.first().copied())
        .unwrap_or(ReasonCode::Unclassified)
}

/// Retry ladder rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    /// Same settings, new seed
    SeedReroll,
    /// Add the failure to the negative prompt
    TightenNegativePrompt,
    /// Raise reference/identity conditioning
    IdentityRescue,
    /// Re-anchor pose and pivot
    PoseRescue,
    /// Regenerate only the broken region
    TargetedInpaint,
    /// Fix in post (alpha cleanup, palette quantize)
    PostProcess,
    /// Regenerate from the baseline instead of the previous frame
    ResetToBaseline,
    /// Regenerate with default settings
    DefaultRegenerate,
}

impl RetryAction {
    /// Hint appended to the generation prompt
    pub fn prompt_hint(self) -> &'static str {
        match self {
            RetryAction::SeedReroll => "reroll seed, keep all settings",
            RetryAction::TightenNegativePrompt => "tighten negative prompt: no background, no blur, crisp pixel edges",
            RetryAction::IdentityRescue => "raise reference weight, lower denoise, keep outfit and face identical",
            RetryAction::PoseRescue => "keep pivot and baseline fixed, match the reference pose skeleton",
            RetryAction::TargetedInpaint => "inpaint only the broken region (hands, face, limbs)",
            RetryAction::PostProcess => "apply alpha cleanup and palette quantization after generation",
            RetryAction::ResetToBaseline => "regenerate from the baseline reference",
            RetryAction::DefaultRegenerate => "regenerate with default settings",
        }
    }

    /// True for the rung that swaps the reference back to the baseline
    pub fn is_reset(self) -> bool {
        matches!(self, RetryAction::ResetToBaseline)
    }
}

impl std::fmt::Display for RetryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryAction::SeedReroll => write!(f, "seed_reroll"),
            RetryAction::TightenNegativePrompt => write!(f, "tighten_negative_prompt"),
            RetryAction::IdentityRescue => write!(f, "identity_rescue"),
            RetryAction::PoseRescue => write!(f, "pose_rescue"),
            RetryAction::TargetedInpaint => write!(f, "targeted_inpaint"),
            RetryAction::PostProcess => write!(f, "post_process"),
            RetryAction::ResetToBaseline => write!(f, "reset_to_baseline"),
            RetryAction::DefaultRegenerate => write!(f, "default_regenerate"),
        }
    }
}
