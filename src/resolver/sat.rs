//! Clause generation over the varisat engine.
//!
//! The pool owns package semantics; this module turns the requirement
//! closure of the jobs into CNF, drives the engine, and runs the
//! deterministic preference passes (keep installed, drop extras).

use crate::errors::*;
use crate::resolver::evr::evr_matches;
use crate::resolver::pool::{Dep, Pool, RelOp, RepoKind, RichDep, SolvableId};
use std::collections::{HashMap, HashSet};
use varisat::{ExtendFormula, Lit, Solver, Var};

const CNF_OR_LIMIT: usize = 64;

pub struct SatSolver {
    solver: Solver<'static>,
    lits: HashMap<SolvableId, Lit>,
    rev: HashMap<Var, SolvableId>,
    encoded: HashSet<SolvableId>,
    queue: Vec<SolvableId>,
    /// Human-readable notes collected during encoding (missing providers).
    pub notes: Vec<String>,
    indicators: Vec<(Lit, String)>,
    last_model: HashSet<SolvableId>,
}

impl Default for SatSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SatSolver {
    pub fn new() -> SatSolver {
        SatSolver {
            solver: Solver::new(),
            lits: HashMap::new(),
            rev: HashMap::new(),
            encoded: HashSet::new(),
            queue: Vec::new(),
            notes: Vec::new(),
            indicators: Vec::new(),
            last_model: HashSet::new(),
        }
    }

    /// The engine literal of a solvable, creating it on first use.
    /// Creation also posts the same-name exclusivity clauses against
    /// already-known candidates and queues the solvable for encoding.
    pub fn lit_for(&mut self, pool: &Pool, id: SolvableId) -> Lit {
        if let Some(&lit) = self.lits.get(&id) {
            return lit;
        }
        let lit = self.solver.new_lit();
        self.lits.insert(id, lit);
        self.rev.insert(lit.var(), id);
        self.queue.push(id);

        // at most one version of a name; multilib twins (same evr,
        // different arch) may coexist
        let me = pool.get(id);
        let siblings: Vec<SolvableId> = pool
            .by_name(me.name())
            .iter()
            .copied()
            .filter(|&other| other != id)
            .filter(|&other| {
                let s = pool.get(other);
                !(s.evr() == me.evr() && s.arch() != me.arch())
            })
            .collect();
        for other in siblings {
            if let Some(&other_lit) = self.lits.get(&other) {
                self.solver.add_clause(&[!lit, !other_lit]);
            }
        }
        lit
    }

    /// Register an install job over a candidate set: indicator ⇒ one of.
    pub fn add_install_job(
        &mut self,
        pool: &Pool,
        candidates: &[SolvableId],
        description: &str,
    ) -> Lit {
        let indicator = self.solver.new_lit();
        let mut clause = vec![!indicator];
        for &id in candidates {
            clause.push(self.lit_for(pool, id));
        }
        self.solver.add_clause(&clause);
        self.indicators
            .push((indicator, description.to_string()));
        indicator
    }

    /// Register an erase job: indicator ⇒ target out.
    pub fn add_erase_job(&mut self, pool: &Pool, id: SolvableId, description: &str) -> Lit {
        let indicator = self.solver.new_lit();
        let target = self.lit_for(pool, id);
        self.solver.add_clause(&[!indicator, !target]);
        self.indicators
            .push((indicator, description.to_string()));
        indicator
    }

    /// Encode everything reachable from the literals created so far.
    pub fn flush(&mut self, pool: &Pool) {
        while let Some(id) = self.queue.pop() {
            if !self.encoded.insert(id) {
                continue;
            }
            self.encode_solvable(pool, id);
        }
    }

    fn providers_filtered(&self, pool: &Pool, dep: &Dep) -> Vec<SolvableId> {
        let mut ids: Vec<SolvableId> = pool
            .whatprovides_dep(dep)
            .into_iter()
            .filter(|&id| {
                let s = pool.get(id);
                s.repo == RepoKind::Installed || pool.arch_allowed(s.arch())
            })
            .collect();
        pool.preference_order(&mut ids);
        ids
    }

    fn leaf_providers(
        &self,
        pool: &Pool,
        name: &str,
        constraint: &Option<(RelOp, String)>,
    ) -> Vec<SolvableId> {
        let dep = match constraint {
            Some((op, evr)) => Dep::Versioned {
                name: name.to_string(),
                op: *op,
                evr: evr.clone(),
            },
            None => Dep::Simple(name.to_string()),
        };
        self.providers_filtered(pool, &dep)
    }

    /// CNF of "this rich requirement is satisfied", clauses over provider
    /// sets. An empty clause marks an unsatisfiable branch.
    fn rich_cnf(&self, pool: &Pool, rich: &RichDep) -> Vec<Vec<SolvableId>> {
        match rich {
            RichDep::Leaf(name, constraint) => {
                vec![self.leaf_providers(pool, name, constraint)]
            }
            RichDep::And(a, b) => {
                let mut clauses = self.rich_cnf(pool, a);
                clauses.extend(self.rich_cnf(pool, b));
                clauses
            }
            RichDep::Or(a, b) => {
                let ca = self.rich_cnf(pool, a);
                let cb = self.rich_cnf(pool, b);
                cnf_or(ca, cb)
            }
            RichDep::With(a, b) => {
                let ca = flatten_providers(&self.rich_cnf(pool, a));
                let cb: HashSet<SolvableId> =
                    flatten_providers(&self.rich_cnf(pool, b)).into_iter().collect();
                vec![ca.into_iter().filter(|id| cb.contains(id)).collect()]
            }
            RichDep::Without(a, b) => {
                let ca = flatten_providers(&self.rich_cnf(pool, a));
                let cb: HashSet<SolvableId> =
                    flatten_providers(&self.rich_cnf(pool, b)).into_iter().collect();
                vec![ca.into_iter().filter(|id| !cb.contains(id)).collect()]
            }
            RichDep::If { then, cond, orelse } => {
                let cond_providers = flatten_providers(&self.rich_cnf(pool, cond));
                let mut clauses = Vec::new();
                // cond holder installed ⇒ then required
                for clause in self.rich_cnf(pool, then) {
                    for &c in &cond_providers {
                        let mut cl = clause.clone();
                        cl.push(NEGATED_MARKER_BASE + c);
                        clauses.push(cl);
                    }
                }
                // no cond holder ⇒ else required
                if let Some(orelse) = orelse {
                    for mut clause in self.rich_cnf(pool, orelse) {
                        clause.extend(cond_providers.iter().copied());
                        clauses.push(clause);
                    }
                }
                clauses
            }
            RichDep::Unless { then, cond, orelse } => {
                let cond_providers = flatten_providers(&self.rich_cnf(pool, cond));
                let mut clauses = Vec::new();
                // no cond holder ⇒ then required
                for mut clause in self.rich_cnf(pool, then) {
                    clause.extend(cond_providers.iter().copied());
                    clauses.push(clause);
                }
                // cond holder installed ⇒ else required
                if let Some(orelse) = orelse {
                    for clause in self.rich_cnf(pool, orelse) {
                        for &c in &cond_providers {
                            let mut cl = clause.clone();
                            cl.push(NEGATED_MARKER_BASE + c);
                            clauses.push(cl);
                        }
                    }
                }
                clauses
            }
        }
    }

    fn encode_solvable(&mut self, pool: &Pool, id: SolvableId) {
        let lit = self.lits[&id];
        let solvable = pool.get(id);
        let installed = solvable.repo == RepoKind::Installed;
        let name = solvable.name().to_string();

        // requires
        let requires = solvable.deps.requires.clone();
        for dep in &requires {
            if dep.is_file() || dep.is_rpmlib() {
                continue;
            }
            match dep {
                Dep::Rich(rich) => {
                    for clause in self.rich_cnf(pool, rich) {
                        self.add_provider_clause(pool, lit, &name, clause, installed, dep);
                    }
                }
                _ => {
                    let providers = self.providers_filtered(pool, dep);
                    self.add_provider_clause(pool, lit, &name, providers, installed, dep);
                }
            }
        }

        // conflicts apply to every foreign provider of the capability
        let conflicts = solvable.deps.conflicts.clone();
        for dep in &conflicts {
            for other in pool.whatprovides_dep(dep) {
                if pool.get(other).name() == name {
                    continue;
                }
                let other_lit = self.lit_for(pool, other);
                self.solver.add_clause(&[!lit, !other_lit]);
            }
        }

        // obsoletes match by package name, not provides
        let obsoletes = solvable.deps.obsoletes.clone();
        for dep in &obsoletes {
            let (obs_name, constraint) = match dep {
                Dep::Simple(n) => (n.clone(), None),
                Dep::Versioned { name, op, evr } => (name.clone(), Some((*op, evr.clone()))),
                Dep::Rich(_) => continue,
            };
            if obs_name == name {
                // self-obsoletes are upgrade cleanup hints
                continue;
            }
            for other in pool.by_name(&obs_name).to_vec() {
                let other_evr = pool.get(other).evr();
                let matches = match &constraint {
                    None => true,
                    Some((op, evr)) => evr_matches(&other_evr, *op, evr),
                };
                if matches {
                    let other_lit = self.lit_for(pool, other);
                    self.solver.add_clause(&[!lit, !other_lit]);
                }
            }
        }
    }

    fn add_provider_clause(
        &mut self,
        pool: &Pool,
        lit: Lit,
        name: &str,
        providers: Vec<SolvableId>,
        installed: bool,
        dep: &Dep,
    ) {
        if providers.is_empty() {
            if installed {
                // the running system satisfies deps the pool cannot see
                // (file lists are not in synthesis)
                return;
            }
            self.notes
                .push(format!("nothing provides {} needed by {name}", dep_display(dep)));
            self.solver.add_clause(&[!lit]);
            return;
        }
        let mut clause = vec![!lit];
        for raw in providers {
            if raw >= NEGATED_MARKER_BASE {
                let other = self.lit_for(pool, raw - NEGATED_MARKER_BASE);
                clause.push(!other);
            } else {
                clause.push(self.lit_for(pool, raw));
            }
        }
        self.solver.add_clause(&clause);
    }

    /// One solve under the given assumptions. On SAT the model is cached.
    pub fn solve(&mut self, pool: &Pool, assumptions: &[Lit]) -> Result<bool> {
        self.flush(pool);
        self.solver.assume(assumptions);
        let sat = self
            .solver
            .solve()
            .map_err(|err| Error::Solver(err.to_string()))?;
        if sat {
            self.last_model.clear();
            if let Some(model) = self.solver.model() {
                for lit in model {
                    if lit.is_positive() {
                        if let Some(id) = self.rev.get(&lit.var()) {
                            self.last_model.insert(*id);
                        }
                    }
                }
            }
        }
        Ok(sat)
    }

    pub fn is_true(&self, id: SolvableId) -> bool {
        self.last_model.contains(&id)
    }

    /// Whether the solver reasoned about this solvable at all.
    pub fn knows(&self, id: SolvableId) -> bool {
        self.lits.contains_key(&id)
    }

    pub fn model(&self) -> &HashSet<SolvableId> {
        &self.last_model
    }

    /// Job descriptions implicated in the last UNSAT answer.
    pub fn failed_jobs(&mut self) -> Vec<String> {
        let core: HashSet<Lit> = self.solver.failed_core().unwrap_or(&[]).iter().copied().collect();
        self.indicators
            .iter()
            .filter(|(lit, _)| core.contains(lit))
            .map(|(_, desc)| desc.clone())
            .collect()
    }

    /// Try to keep as much of the installed set as possible, then drop
    /// available packages nothing forces in. Both passes are greedy,
    /// incremental and deterministic.
    pub fn minimize(&mut self, pool: &Pool, assumptions: &mut Vec<Lit>) -> Result<()> {
        // keep installed
        let mut installed: Vec<SolvableId> = self
            .lits
            .keys()
            .copied()
            .filter(|&id| pool.get(id).repo == RepoKind::Installed)
            .collect();
        installed.sort_by(|&a, &b| pool.get(a).name().cmp(pool.get(b).name()).then(a.cmp(&b)));
        for id in installed {
            if self.is_true(id) {
                continue;
            }
            let lit = self.lits[&id];
            assumptions.push(lit);
            if !self.solve(pool, assumptions)? {
                assumptions.pop();
            }
        }
        // re-establish a model for the accepted assumption set
        if !self.solve(pool, assumptions)? {
            return Err(Error::Solver("minimization lost satisfiability".into()));
        }

        // drop extras, least preferred first
        let mut extras: Vec<SolvableId> = self
            .lits
            .keys()
            .copied()
            .filter(|&id| pool.get(id).repo != RepoKind::Installed)
            .collect();
        pool.preference_order(&mut extras);
        extras.reverse();
        for id in extras {
            if !self.is_true(id) {
                continue;
            }
            let lit = self.lits[&id];
            assumptions.push(!lit);
            if !self.solve(pool, assumptions)? {
                assumptions.pop();
            }
        }
        if !self.solve(pool, assumptions)? {
            return Err(Error::Solver("minimization lost satisfiability".into()));
        }
        Ok(())
    }

    /// Weak extension: accept the candidate if it keeps the problem
    /// satisfiable, drop it otherwise.
    pub fn try_weak(
        &mut self,
        pool: &Pool,
        assumptions: &mut Vec<Lit>,
        id: SolvableId,
    ) -> Result<bool> {
        let lit = self.lit_for(pool, id);
        assumptions.push(lit);
        if self.solve(pool, assumptions)? {
            Ok(true)
        } else {
            assumptions.pop();
            // restore the model of the accepted set
            self.solve(pool, assumptions)?;
            Ok(false)
        }
    }
}

/// Marker space for negated provider ids inside rich-dep clauses.
/// Ids never get near this in practice (pools are a few 100k solvables).
const NEGATED_MARKER_BASE: SolvableId = 1 << 48;

fn flatten_providers(clauses: &[Vec<SolvableId>]) -> Vec<SolvableId> {
    let mut all: Vec<SolvableId> = clauses
        .iter()
        .flatten()
        .copied()
        .filter(|&id| id < NEGATED_MARKER_BASE)
        .collect();
    all.sort_unstable();
    all.dedup();
    all
}

fn cnf_or(a: Vec<Vec<SolvableId>>, b: Vec<Vec<SolvableId>>) -> Vec<Vec<SolvableId>> {
    if a.len() * b.len() > CNF_OR_LIMIT {
        // fall back to the union clause rather than exploding
        let mut merged = flatten_providers(&a);
        merged.extend(flatten_providers(&b));
        merged.sort_unstable();
        merged.dedup();
        return vec![merged];
    }
    let mut out = Vec::new();
    for ca in &a {
        for cb in &b {
            let mut clause = ca.clone();
            clause.extend(cb.iter().copied());
            clause.sort_unstable();
            clause.dedup();
            out.push(clause);
        }
    }
    out
}

fn dep_display(dep: &Dep) -> String {
    match dep {
        Dep::Simple(name) => name.clone(),
        Dep::Versioned { name, op, evr } => {
            let op = match op {
                RelOp::Lt => "<",
                RelOp::Le => "<=",
                RelOp::Eq => "=",
                RelOp::Ge => ">=",
                RelOp::Gt => ">",
            };
            format!("{name} {op} {evr}")
        }
        Dep::Rich(_) => "rich dependency".to_string(),
    }
}
