//! # TETRAKIN Model
//!
//! Biochemical model catalogue for reaction-diffusion simulation.
//!
//! A [`Model`] is a registry of species, volume systems, and surface
//! systems. Volume systems group reactions and diffusion rules that apply
//! wherever the system is attached to a compartment; surface systems do
//! the same for patches. Attachment happens by *name* on the geometry
//! side, and names are resolved when a solver is set up.
//!
//! ## Capabilities
//!
//! 1. **Species registry**: stable names, globally unique indices
//! 2. **Volume reactions**: mass action with arbitrary stoichiometry up to order 4
//! 3. **Surface reactions**: three-sided stoichiometry (surface / inner volume / outer volume)
//! 4. **Diffusion rules**: volume (3D) and surface (2D) diffusion constants
//! 5. **Validation at registration**: name conflicts, stoichiometry, order cap

use serde::{Deserialize, Serialize};
use tetrakin_core::{Dcst, Kcst, Result, SimError, MAX_ORDER};

// =============================================================================
// STOICHIOMETRY
// =============================================================================

/// Species reference with a stoichiometric multiplicity.
///
/// Multiplicities are unsigned; a negative coefficient cannot be
/// expressed, and a zero coefficient is rejected at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRef {
    pub species: String,
    pub mult: u32,
}

impl SpecRef {
    pub fn new(species: &str, mult: u32) -> Self {
        Self {
            species: species.to_string(),
            mult,
        }
    }
}

/// Shorthand for a unit-multiplicity reference
pub fn spec(species: &str) -> SpecRef {
    SpecRef::new(species, 1)
}

fn total_mult(refs: &[SpecRef]) -> u32 {
    refs.iter().map(|r| r.mult).sum()
}

fn check_stoich(refs: &[SpecRef], ctx: &str) -> Result<()> {
    for r in refs {
        if r.mult == 0 {
            return Err(SimError::InvalidStoichiometry(format!(
                "zero coefficient for '{}' in {}",
                r.species, ctx
            )));
        }
    }
    Ok(())
}

// =============================================================================
// VOLUME REACTIONS
// =============================================================================

/// Volumetric mass-action reaction.
///
/// The rate constant follows the litres-basis convention: s^-1 for first
/// order, L mol^-1 s^-1 for second order, and mol L^-1 s^-1 for a
/// zero-order source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    pub lhs: Vec<SpecRef>,
    pub rhs: Vec<SpecRef>,
    pub kcst: Kcst,
}

impl Reaction {
    pub fn new(name: &str, lhs: Vec<SpecRef>, rhs: Vec<SpecRef>, kcst: Kcst) -> Self {
        Self {
            name: name.to_string(),
            lhs,
            rhs,
            kcst,
        }
    }

    /// Create a simple A -> B reaction
    pub fn simple(name: &str, reactant: &str, product: &str, kcst: Kcst) -> Self {
        Self::new(name, vec![spec(reactant)], vec![spec(product)], kcst)
    }

    /// Sum of left-hand multiplicities
    pub fn order(&self) -> u32 {
        total_mult(&self.lhs)
    }

    fn validate(&self) -> Result<()> {
        if self.kcst < 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "negative rate constant for reaction '{}'",
                self.name
            )));
        }
        check_stoich(&self.lhs, &format!("reaction '{}'", self.name))?;
        check_stoich(&self.rhs, &format!("reaction '{}'", self.name))?;
        let order = self.order();
        if order > MAX_ORDER {
            return Err(SimError::UnsupportedOrder {
                reaction: self.name.clone(),
                order,
            });
        }
        Ok(())
    }
}

// =============================================================================
// SURFACE REACTIONS
// =============================================================================

/// Surface reaction with three-sided stoichiometry.
///
/// Reactants and products can sit on the surface itself (`slhs`/`srhs`),
/// in the inner volume (`ilhs`/`irhs`), or in the outer volume
/// (`olhs`/`orhs`). Reactants may touch at most one of the two volumes;
/// products are unrestricted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceReaction {
    pub name: String,
    pub slhs: Vec<SpecRef>,
    pub ilhs: Vec<SpecRef>,
    pub olhs: Vec<SpecRef>,
    pub srhs: Vec<SpecRef>,
    pub irhs: Vec<SpecRef>,
    pub orhs: Vec<SpecRef>,
    pub kcst: Kcst,
}

impl SurfaceReaction {
    pub fn new(name: &str, kcst: Kcst) -> Self {
        Self {
            name: name.to_string(),
            kcst,
            ..Default::default()
        }
    }

    pub fn with_slhs(mut self, refs: Vec<SpecRef>) -> Self {
        self.slhs = refs;
        self
    }

    pub fn with_ilhs(mut self, refs: Vec<SpecRef>) -> Self {
        self.ilhs = refs;
        self
    }

    pub fn with_olhs(mut self, refs: Vec<SpecRef>) -> Self {
        self.olhs = refs;
        self
    }

    pub fn with_srhs(mut self, refs: Vec<SpecRef>) -> Self {
        self.srhs = refs;
        self
    }

    pub fn with_irhs(mut self, refs: Vec<SpecRef>) -> Self {
        self.irhs = refs;
        self
    }

    pub fn with_orhs(mut self, refs: Vec<SpecRef>) -> Self {
        self.orhs = refs;
        self
    }

    /// Sum of left-hand multiplicities over all three sides
    pub fn order(&self) -> u32 {
        total_mult(&self.slhs) + total_mult(&self.ilhs) + total_mult(&self.olhs)
    }

    /// True when every reactant sits on the surface
    pub fn is_surface_surface(&self) -> bool {
        self.ilhs.is_empty() && self.olhs.is_empty()
    }

    /// True when the volume reactants (if any) sit in the inner volume.
    /// Determines which adjacent volume scales the rate constant.
    pub fn inner(&self) -> bool {
        self.olhs.is_empty()
    }

    /// True when the reaction touches the outer volume at all
    pub fn reads_outer(&self) -> bool {
        !self.olhs.is_empty() || !self.orhs.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.kcst < 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "negative rate constant for surface reaction '{}'",
                self.name
            )));
        }
        if !self.ilhs.is_empty() && !self.olhs.is_empty() {
            return Err(SimError::InvalidReaction(format!(
                "surface reaction '{}' has reactants in both inner and outer volumes",
                self.name
            )));
        }
        let ctx = format!("surface reaction '{}'", self.name);
        check_stoich(&self.slhs, &ctx)?;
        check_stoich(&self.ilhs, &ctx)?;
        check_stoich(&self.olhs, &ctx)?;
        check_stoich(&self.srhs, &ctx)?;
        check_stoich(&self.irhs, &ctx)?;
        check_stoich(&self.orhs, &ctx)?;
        let order = self.order();
        if order > MAX_ORDER {
            return Err(SimError::UnsupportedOrder {
                reaction: self.name.clone(),
                order,
            });
        }
        Ok(())
    }
}

// =============================================================================
// DIFFUSION RULES
// =============================================================================

/// Volume diffusion rule: one species, one diffusion constant (m^2/s)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDiffusion {
    pub name: String,
    pub species: String,
    pub dcst: Dcst,
}

impl VolumeDiffusion {
    pub fn new(name: &str, species: &str, dcst: Dcst) -> Self {
        Self {
            name: name.to_string(),
            species: species.to_string(),
            dcst,
        }
    }
}

/// Surface diffusion rule: one species diffusing within a patch (m^2/s)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceDiffusion {
    pub name: String,
    pub species: String,
    pub dcst: Dcst,
}

impl SurfaceDiffusion {
    pub fn new(name: &str, species: &str, dcst: Dcst) -> Self {
        Self {
            name: name.to_string(),
            species: species.to_string(),
            dcst,
        }
    }
}

// =============================================================================
// SYSTEMS
// =============================================================================

/// Named grouping of volume reactions and diffusion rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSystem {
    pub name: String,
    pub reactions: Vec<Reaction>,
    pub diffusions: Vec<VolumeDiffusion>,
}

impl VolumeSystem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reactions: Vec::new(),
            diffusions: Vec::new(),
        }
    }

    pub fn reaction(&self, name: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.name == name)
    }

    pub fn diffusion(&self, name: &str) -> Option<&VolumeDiffusion> {
        self.diffusions.iter().find(|d| d.name == name)
    }
}

/// Named grouping of surface reactions and surface diffusion rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceSystem {
    pub name: String,
    pub reactions: Vec<SurfaceReaction>,
    pub diffusions: Vec<SurfaceDiffusion>,
}

impl SurfaceSystem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reactions: Vec::new(),
            diffusions: Vec::new(),
        }
    }

    pub fn reaction(&self, name: &str) -> Option<&SurfaceReaction> {
        self.reactions.iter().find(|r| r.name == name)
    }

    pub fn diffusion(&self, name: &str) -> Option<&SurfaceDiffusion> {
        self.diffusions.iter().find(|d| d.name == name)
    }
}

// =============================================================================
// MODEL
// =============================================================================

/// Complete biochemical model: species plus volume and surface systems.
///
/// All registration goes through this type so that species references can
/// be validated the moment a rule is added. Everything is immutable after
/// a solver has been set up on the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    species: Vec<String>,
    vsys: Vec<VolumeSystem>,
    ssys: Vec<SurfaceSystem>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a species; its index is stable from here on
    pub fn add_species(&mut self, name: &str) -> Result<usize> {
        if self.species.iter().any(|s| s == name) {
            return Err(SimError::NameConflict(format!(
                "species '{}' already registered",
                name
            )));
        }
        self.species.push(name.to_string());
        Ok(self.species.len() - 1)
    }

    /// Register an empty volume system
    pub fn add_volume_system(&mut self, name: &str) -> Result<()> {
        if self.vsys.iter().any(|v| v.name == name) {
            return Err(SimError::NameConflict(format!(
                "volume system '{}' already registered",
                name
            )));
        }
        self.vsys.push(VolumeSystem::new(name));
        Ok(())
    }

    /// Register an empty surface system
    pub fn add_surface_system(&mut self, name: &str) -> Result<()> {
        if self.ssys.iter().any(|s| s.name == name) {
            return Err(SimError::NameConflict(format!(
                "surface system '{}' already registered",
                name
            )));
        }
        self.ssys.push(SurfaceSystem::new(name));
        Ok(())
    }

    /// Add a reaction to a volume system
    pub fn add_reaction(&mut self, vsys: &str, reaction: Reaction) -> Result<()> {
        reaction.validate()?;
        self.check_species(reaction.lhs.iter().chain(&reaction.rhs))?;
        let sys = self.vsys_mut(vsys)?;
        if sys.reaction(&reaction.name).is_some() {
            return Err(SimError::NameConflict(format!(
                "reaction '{}' already in volume system '{}'",
                reaction.name, vsys
            )));
        }
        sys.reactions.push(reaction);
        Ok(())
    }

    /// Add a surface reaction to a surface system
    pub fn add_surface_reaction(&mut self, ssys: &str, reaction: SurfaceReaction) -> Result<()> {
        reaction.validate()?;
        self.check_species(
            reaction
                .slhs
                .iter()
                .chain(&reaction.ilhs)
                .chain(&reaction.olhs)
                .chain(&reaction.srhs)
                .chain(&reaction.irhs)
                .chain(&reaction.orhs),
        )?;
        let sys = self.ssys_mut(ssys)?;
        if sys.reaction(&reaction.name).is_some() {
            return Err(SimError::NameConflict(format!(
                "surface reaction '{}' already in surface system '{}'",
                reaction.name, ssys
            )));
        }
        sys.reactions.push(reaction);
        Ok(())
    }

    /// Add a volume diffusion rule to a volume system
    pub fn add_volume_diffusion(&mut self, vsys: &str, diff: VolumeDiffusion) -> Result<()> {
        if diff.dcst < 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "negative diffusion constant for '{}'",
                diff.name
            )));
        }
        if self.species_index(&diff.species).is_none() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "unknown species '{}' in diffusion rule '{}'",
                diff.species, diff.name
            )));
        }
        let sys = self.vsys_mut(vsys)?;
        if sys.diffusion(&diff.name).is_some() {
            return Err(SimError::NameConflict(format!(
                "diffusion rule '{}' already in volume system '{}'",
                diff.name, vsys
            )));
        }
        sys.diffusions.push(diff);
        Ok(())
    }

    /// Add a surface diffusion rule to a surface system
    pub fn add_surface_diffusion(&mut self, ssys: &str, diff: SurfaceDiffusion) -> Result<()> {
        if diff.dcst < 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "negative diffusion constant for '{}'",
                diff.name
            )));
        }
        if self.species_index(&diff.species).is_none() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "unknown species '{}' in surface diffusion rule '{}'",
                diff.species, diff.name
            )));
        }
        let sys = self.ssys_mut(ssys)?;
        if sys.diffusion(&diff.name).is_some() {
            return Err(SimError::NameConflict(format!(
                "surface diffusion rule '{}' already in surface system '{}'",
                diff.name, ssys
            )));
        }
        sys.diffusions.push(diff);
        Ok(())
    }

    /// Registered species names, in index order
    pub fn species(&self) -> &[String] {
        &self.species
    }

    /// Global index of a species name
    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species.iter().position(|s| s == name)
    }

    /// Look up a volume system by name
    pub fn volume_system(&self, name: &str) -> Option<&VolumeSystem> {
        self.vsys.iter().find(|v| v.name == name)
    }

    /// Look up a surface system by name
    pub fn surface_system(&self, name: &str) -> Option<&SurfaceSystem> {
        self.ssys.iter().find(|s| s.name == name)
    }

    pub fn volume_systems(&self) -> &[VolumeSystem] {
        &self.vsys
    }

    pub fn surface_systems(&self) -> &[SurfaceSystem] {
        &self.ssys
    }

    fn vsys_mut(&mut self, name: &str) -> Result<&mut VolumeSystem> {
        self.vsys
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("unknown volume system '{}'", name))
            })
    }

    fn ssys_mut(&mut self, name: &str) -> Result<&mut SurfaceSystem> {
        self.ssys
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("unknown surface system '{}'", name))
            })
    }

    fn check_species<'a, I: Iterator<Item = &'a SpecRef>>(&self, refs: I) -> Result<()> {
        for r in refs {
            if self.species_index(&r.species).is_none() {
                return Err(SimError::ArgumentOutOfRange(format!(
                    "unknown species '{}'",
                    r.species
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// STANDARD MODELS
// =============================================================================

pub mod models {
    use super::*;

    /// Reversible binding A + B <-> C in a volume system "vsys".
    ///
    /// kf = 3e5 L mol^-1 s^-1, kb = 0.7 s^-1.
    pub fn ab_binding() -> Model {
        let mut model = Model::new();
        model.add_species("A").unwrap();
        model.add_species("B").unwrap();
        model.add_species("C").unwrap();
        model.add_volume_system("vsys").unwrap();

        model
            .add_reaction(
                "vsys",
                Reaction::new("fwd", vec![spec("A"), spec("B")], vec![spec("C")], 3.0e5),
            )
            .unwrap();
        model
            .add_reaction(
                "vsys",
                Reaction::new("bwd", vec![spec("C")], vec![spec("A"), spec("B")], 0.7),
            )
            .unwrap();
        model
    }

    /// A single diffusing species X with diffusion constant `dcst`
    pub fn diffusion_only(dcst: Dcst) -> Model {
        let mut model = Model::new();
        model.add_species("X").unwrap();
        model.add_volume_system("vsys").unwrap();
        model
            .add_volume_diffusion("vsys", VolumeDiffusion::new("diff_X", "X", dcst))
            .unwrap();
        model
    }

    /// Surface binding R + Ca (volume) -> RCa (surface).
    ///
    /// k = 8.889e6 L mol^-1 s^-1; R and RCa live on the surface system
    /// "ssys", Ca in the volume system "vsys".
    pub fn surface_binding() -> Model {
        let mut model = Model::new();
        model.add_species("Ca").unwrap();
        model.add_species("R").unwrap();
        model.add_species("RCa").unwrap();
        model.add_volume_system("vsys").unwrap();
        model.add_surface_system("ssys").unwrap();

        model
            .add_surface_reaction(
                "ssys",
                SurfaceReaction::new("bind", 8.889e6)
                    .with_slhs(vec![spec("R")])
                    .with_ilhs(vec![spec("Ca")])
                    .with_srhs(vec![spec("RCa")]),
            )
            .unwrap();
        model
    }

    /// Zero-order source: nothing -> A at `kcst` mol L^-1 s^-1
    pub fn zero_order_source(kcst: Kcst) -> Model {
        let mut model = Model::new();
        model.add_species("A").unwrap();
        model.add_volume_system("vsys").unwrap();
        model
            .add_reaction("vsys", Reaction::new("src", vec![], vec![spec("A")], kcst))
            .unwrap();
        model
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_species_registry() {
        let mut model = Model::new();
        assert_eq!(model.add_species("A").unwrap(), 0);
        assert_eq!(model.add_species("B").unwrap(), 1);
        assert_eq!(model.species_index("B"), Some(1));
        assert!(matches!(
            model.add_species("A"),
            Err(SimError::NameConflict(_))
        ));
    }

    #[test]
    fn test_reaction_order() {
        let r = Reaction::new(
            "r",
            vec![SpecRef::new("A", 2), spec("B")],
            vec![spec("C")],
            1.0,
        );
        assert_eq!(r.order(), 3);
    }

    #[test]
    fn test_order_cap() {
        let mut model = models::ab_binding();
        let r = Reaction::new("r5", vec![SpecRef::new("A", 5)], vec![spec("C")], 1.0);
        assert!(matches!(
            model.add_reaction("vsys", r),
            Err(SimError::UnsupportedOrder { order: 5, .. })
        ));
    }

    #[test]
    fn test_zero_stoichiometry_rejected() {
        let mut model = models::ab_binding();
        let r = Reaction::new("bad", vec![SpecRef::new("A", 0)], vec![spec("C")], 1.0);
        assert!(matches!(
            model.add_reaction("vsys", r),
            Err(SimError::InvalidStoichiometry(_))
        ));
    }

    #[test]
    fn test_negative_kcst_rejected() {
        let mut model = models::ab_binding();
        let r = Reaction::simple("bad", "A", "C", -1.0);
        assert!(matches!(
            model.add_reaction("vsys", r),
            Err(SimError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn test_unknown_species_rejected() {
        let mut model = models::ab_binding();
        let r = Reaction::simple("bad", "Z", "C", 1.0);
        assert!(matches!(
            model.add_reaction("vsys", r),
            Err(SimError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn test_straddling_sreac_rejected() {
        let mut model = Model::new();
        model.add_species("X").unwrap();
        model.add_species("Y").unwrap();
        model.add_surface_system("ssys").unwrap();
        let sr = SurfaceReaction::new("bad", 1.0)
            .with_ilhs(vec![spec("X")])
            .with_olhs(vec![spec("Y")]);
        assert!(matches!(
            model.add_surface_reaction("ssys", sr),
            Err(SimError::InvalidReaction(_))
        ));
    }

    #[test]
    fn test_sreac_classification() {
        let ss = SurfaceReaction::new("ss", 1.0)
            .with_slhs(vec![spec("R"), spec("R")])
            .with_srhs(vec![spec("R")]);
        assert!(ss.is_surface_surface());
        assert!(ss.inner());

        let sv = SurfaceReaction::new("sv", 1.0)
            .with_slhs(vec![spec("R")])
            .with_ilhs(vec![spec("Ca")]);
        assert!(!sv.is_surface_surface());
        assert!(sv.inner());

        let so = SurfaceReaction::new("so", 1.0)
            .with_slhs(vec![spec("R")])
            .with_olhs(vec![spec("Ca")]);
        assert!(!so.inner());
        assert!(so.reads_outer());
    }

    #[test]
    fn test_duplicate_reaction_name() {
        let mut model = models::ab_binding();
        let r = Reaction::simple("fwd", "A", "C", 1.0);
        assert!(matches!(
            model.add_reaction("vsys", r),
            Err(SimError::NameConflict(_))
        ));
    }

    #[test]
    fn test_negative_dcst_rejected() {
        let mut model = models::diffusion_only(1e-10);
        let d = VolumeDiffusion::new("bad", "X", -1e-10);
        assert!(matches!(
            model.add_volume_diffusion("vsys", d),
            Err(SimError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn test_standard_models() {
        let m = models::ab_binding();
        assert_eq!(m.species().len(), 3);
        assert_eq!(m.volume_system("vsys").unwrap().reactions.len(), 2);

        let m = models::surface_binding();
        let sr = m.surface_system("ssys").unwrap().reaction("bind").unwrap();
        assert_eq!(sr.order(), 2);
        assert!(!sr.is_surface_surface());

        let m = models::zero_order_source(1.0);
        assert_eq!(m.volume_system("vsys").unwrap().reaction("src").unwrap().order(), 0);
    }
}
