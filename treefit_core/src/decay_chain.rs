//! The decay chain: a built tree plus its ordered constraint list.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::candidate::{Candidate, CandidateId};
use crate::config::FitConfig;
use crate::constraint::Constraint;
use crate::error::TreeFitError;
use crate::fit_params::FitParams;
use crate::particle::NodeId;
use crate::pdg::SharedProperties;
use crate::tree::DecayTree;

pub struct DecayChain {
    tree: DecayTree,
    head: NodeId,
    constraints: Vec<Constraint>,
}

impl DecayChain {
    /// Builds the tree for `head`, assigns indices and collects the
    /// constraints, deepest first.
    pub fn new(
        head: &Candidate,
        config: Arc<FitConfig>,
        properties: SharedProperties,
    ) -> Result<Self, TreeFitError> {
        let (tree, head_id) = DecayTree::build(head, config, properties)?;

        let mut constraints = Vec::new();
        if let Some(root) = tree.root() {
            tree.add_to_constraint_list(root, &mut constraints, 0);
        }
        constraints.retain(|c| !tree.config().is_disabled(c.kind));
        constraints.sort_by_key(Constraint::priority);

        debug!(
            "TreeFitter: decay chain with {} nodes, dim {}, {} constraints",
            tree.len(),
            tree.dim().unwrap_or(0),
            constraints.len()
        );
        Ok(Self {
            tree,
            head: head_id,
            constraints,
        })
    }

    pub fn tree(&self) -> &DecayTree {
        &self.tree
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn dim(&self) -> usize {
        self.tree.dim().unwrap_or(0)
    }

    /// Seeds state and covariance for the first iteration.
    pub fn initialize(&self, fit_params: &mut FitParams) -> Result<(), TreeFitError> {
        fit_params.reset_covariance();
        self.tree.init_state(fit_params)?;
        self.init_covariance(fit_params);
        Ok(())
    }

    /// Rewrites the loose starting covariance over the whole tree.
    pub fn init_covariance(&self, fit_params: &mut FitParams) {
        if let Some(root) = self.tree.root() {
            self.tree.init_covariance(root, fit_params);
        }
    }

    /// Applies every constraint in order, iterating each locally.
    pub fn filter(&self, fit_params: &mut FitParams) -> Result<(), TreeFitError> {
        for constraint in &self.constraints {
            constraint.filter(&self.tree, fit_params)?;
            trace!(
                "{} constraint of {}: chi2 {:.4}",
                constraint.kind,
                self.tree[constraint.node].name,
                fit_params.chi_square()
            );
        }
        Ok(())
    }

    /// Applies every constraint linearised around `reference`.
    pub fn filter_with_reference(
        &self,
        fit_params: &mut FitParams,
        reference: &FitParams,
    ) -> Result<(), TreeFitError> {
        for constraint in &self.constraints {
            constraint.filter_with_reference(&self.tree, fit_params, reference)?;
        }
        Ok(())
    }

    /// Node backed by `candidate`, if it is part of the fit tree.
    pub fn locate(&self, candidate: CandidateId) -> Option<NodeId> {
        self.tree.locate(candidate)
    }

    /// First state index of the node backed by `candidate`.
    pub fn index(&self, candidate: CandidateId) -> Option<usize> {
        self.locate(candidate).and_then(|id| self.tree[id].index())
    }

    pub fn pos_index(&self, candidate: CandidateId) -> Option<usize> {
        self.locate(candidate).and_then(|id| self.tree[id].pos_index())
    }

    pub fn tau_index(&self, candidate: CandidateId) -> Option<usize> {
        self.locate(candidate).and_then(|id| self.tree[id].tau_index())
    }

    pub fn mom_index(&self, candidate: CandidateId) -> Option<usize> {
        self.locate(candidate).and_then(|id| self.tree[id].mom_index())
    }

    /// Chi-square and degrees of freedom of the subtree of the head.
    pub fn head_chi_square(&self, fit_params: &FitParams) -> (f64, i64) {
        (
            self.tree.chi_square(self.head, fit_params),
            self.tree.n_dof(self.head, fit_params),
        )
    }
}
