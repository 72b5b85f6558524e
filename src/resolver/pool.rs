use crate::resolver::evr::evr_cmp;
use crate::synthesis::PackageRecord;
use globset::GlobBuilder;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

pub type SolvableId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    Installed,
    Available,
    LocalRpms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl RelOp {
    pub fn parse(s: &str) -> Option<RelOp> {
        match s {
            "<" => Some(RelOp::Lt),
            "<=" | "=<" => Some(RelOp::Le),
            "=" | "==" => Some(RelOp::Eq),
            ">=" | "=>" => Some(RelOp::Ge),
            ">" => Some(RelOp::Gt),
            _ => None,
        }
    }
}

/// A parsed capability: a bare name, a versioned relation, or a rich
/// boolean expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Dep {
    Simple(String),
    Versioned {
        name: String,
        op: RelOp,
        evr: String,
    },
    Rich(RichDep),
}

impl Dep {
    pub fn name(&self) -> &str {
        match self {
            Dep::Simple(name) => name,
            Dep::Versioned { name, .. } => name,
            Dep::Rich(_) => "",
        }
    }

    pub fn is_file(&self) -> bool {
        self.name().starts_with('/')
    }

    pub fn is_rpmlib(&self) -> bool {
        self.name().starts_with("rpmlib(")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RichDep {
    Leaf(String, Option<(RelOp, String)>),
    And(Box<RichDep>, Box<RichDep>),
    Or(Box<RichDep>, Box<RichDep>),
    With(Box<RichDep>, Box<RichDep>),
    Without(Box<RichDep>, Box<RichDep>),
    If {
        then: Box<RichDep>,
        cond: Box<RichDep>,
        orelse: Option<Box<RichDep>>,
    },
    Unless {
        then: Box<RichDep>,
        cond: Box<RichDep>,
        orelse: Option<Box<RichDep>>,
    },
}

static BRACKET_CAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\[]+)\[([<>=!]+)\s*(.+)\]$").expect("static regex"));
static SPACED_CAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(>=|<=|==|=|>|<)\s+(.+)$").expect("static regex"));

/// Parse one capability string.
///
/// Accepted shapes: `name`, `name op evr`, `name[op evr]`, `name[*]`
/// (scriptlet marker, stripped) and parenthesized rich expressions.
pub fn parse_capability(cap: &str) -> Dep {
    let cap = cap.trim();
    if cap.starts_with('(') {
        if let Some(rich) = parse_rich(cap) {
            return Dep::Rich(rich);
        }
        return Dep::Simple(cap.to_string());
    }

    let cap = cap.replace("[*]", "");

    if !cap.contains('[') {
        if let Some(m) = SPACED_CAP.captures(&cap) {
            if let Some(op) = RelOp::parse(&m[2]) {
                return Dep::Versioned {
                    name: m[1].to_string(),
                    op,
                    evr: m[3].to_string(),
                };
            }
        }
        return Dep::Simple(cap);
    }

    if let Some(m) = BRACKET_CAP.captures(&cap) {
        if let Some(op) = RelOp::parse(&m[2]) {
            return Dep::Versioned {
                name: m[1].to_string(),
                op,
                evr: m[3].to_string(),
            };
        }
    }
    Dep::Simple(cap)
}

fn tokenize_rich(expr: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    for ch in expr.chars() {
        match ch {
            '(' if depth == 0 => {
                if !current.trim().is_empty() {
                    tokens.push(current.trim().to_string());
                }
                current = String::from("(");
                depth += 1;
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
                if depth == 0 {
                    tokens.push(current.trim().to_string());
                    current = String::new();
                }
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.trim().is_empty() {
                    tokens.push(current.trim().to_string());
                }
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }
    tokens
}

/// Parse a rich boolean dependency like `(pkgA or pkgB)`,
/// `(pkgA if pkgB else pkgC)`, `(a >= 1.0 with b)`.
pub fn parse_rich(expr: &str) -> Option<RichDep> {
    let inner = expr.strip_prefix('(')?.strip_suffix(')')?;
    let tokens = tokenize_rich(inner);
    parse_rich_tokens(&tokens)
}

fn parse_rich_operand(tokens: &[String]) -> Option<(RichDep, usize)> {
    let first = tokens.first()?;
    if first.starts_with('(') {
        return Some((parse_rich(first)?, 1));
    }
    // leaf, optionally "name op evr"
    if tokens.len() >= 3 {
        if let Some(op) = RelOp::parse(&tokens[1]) {
            return Some((
                RichDep::Leaf(first.clone(), Some((op, tokens[2].clone()))),
                3,
            ));
        }
    }
    Some((RichDep::Leaf(first.clone(), None), 1))
}

fn parse_rich_tokens(tokens: &[String]) -> Option<RichDep> {
    let (mut lhs, mut pos) = parse_rich_operand(tokens)?;

    while pos < tokens.len() {
        let op = tokens[pos].to_lowercase();
        pos += 1;
        let (rhs, used) = parse_rich_operand(&tokens[pos..])?;
        pos += used;

        lhs = match op.as_str() {
            "and" => RichDep::And(Box::new(lhs), Box::new(rhs)),
            "or" => RichDep::Or(Box::new(lhs), Box::new(rhs)),
            "with" => RichDep::With(Box::new(lhs), Box::new(rhs)),
            "without" => RichDep::Without(Box::new(lhs), Box::new(rhs)),
            "if" | "unless" => {
                let orelse = if tokens.get(pos).map(|t| t.as_str()) == Some("else") {
                    pos += 1;
                    let (e, used) = parse_rich_operand(&tokens[pos..])?;
                    pos += used;
                    Some(Box::new(e))
                } else {
                    None
                };
                if op == "if" {
                    RichDep::If {
                        then: Box::new(lhs),
                        cond: Box::new(rhs),
                        orelse,
                    }
                } else {
                    RichDep::Unless {
                        then: Box::new(lhs),
                        cond: Box::new(rhs),
                        orelse,
                    }
                }
            }
            _ => return None,
        };
    }
    Some(lhs)
}

/// Whether a provided version range satisfies a required one.
fn ranges_overlap(prov_op: RelOp, prov_evr: &str, req_op: RelOp, req_evr: &str) -> bool {
    let cmp = evr_cmp(prov_evr, req_evr);
    match (prov_op, req_op) {
        (RelOp::Eq, RelOp::Eq) => cmp == Ordering::Equal,
        (RelOp::Eq, RelOp::Ge) => cmp != Ordering::Less,
        (RelOp::Eq, RelOp::Gt) => cmp == Ordering::Greater,
        (RelOp::Eq, RelOp::Le) => cmp != Ordering::Greater,
        (RelOp::Eq, RelOp::Lt) => cmp == Ordering::Less,
        (RelOp::Ge, RelOp::Eq) | (RelOp::Ge, RelOp::Le) => cmp != Ordering::Greater,
        (RelOp::Gt, RelOp::Eq) | (RelOp::Gt, RelOp::Le) | (RelOp::Gt, RelOp::Lt) => {
            cmp == Ordering::Less
        }
        (RelOp::Ge, RelOp::Lt) => cmp == Ordering::Less,
        (RelOp::Le, RelOp::Eq) | (RelOp::Le, RelOp::Ge) => cmp != Ordering::Less,
        (RelOp::Lt, RelOp::Eq) | (RelOp::Lt, RelOp::Ge) | (RelOp::Lt, RelOp::Gt) => {
            cmp == Ordering::Greater
        }
        (RelOp::Le, RelOp::Gt) => cmp == Ordering::Greater,
        // two lower bounds or two upper bounds always overlap
        (RelOp::Ge | RelOp::Gt, RelOp::Ge | RelOp::Gt) => true,
        (RelOp::Le | RelOp::Lt, RelOp::Le | RelOp::Lt) => true,
    }
}

#[derive(Debug, Clone)]
pub struct DepSet {
    pub provides: Vec<Dep>,
    pub requires: Vec<Dep>,
    pub conflicts: Vec<Dep>,
    pub obsoletes: Vec<Dep>,
    pub recommends: Vec<Dep>,
    pub suggests: Vec<Dep>,
}

#[derive(Debug, Clone)]
pub struct Solvable {
    pub id: SolvableId,
    pub record: PackageRecord,
    pub repo: RepoKind,
    pub media_name: String,
    pub priority: i64,
    pub local_path: Option<PathBuf>,
    pub deps: DepSet,
}

impl Solvable {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn evr(&self) -> String {
        self.record.evr()
    }

    pub fn arch(&self) -> &str {
        &self.record.arch
    }

    pub fn nevra(&self) -> &str {
        &self.record.nevra
    }
}

#[derive(Debug, Default)]
pub struct Pool {
    pub arch: String,
    pub allowed_arches: Vec<String>,
    pub solvables: Vec<Solvable>,
    by_name: HashMap<String, Vec<SolvableId>>,
    whatprovides: HashMap<String, Vec<SolvableId>>,
}

fn parse_all(caps: &[String]) -> Vec<Dep> {
    caps.iter()
        .filter(|c| !c.starts_with("rpmlib("))
        .map(|c| parse_capability(c))
        .collect()
}

fn rich_leaf_names(rich: &RichDep, out: &mut Vec<String>) {
    match rich {
        RichDep::Leaf(name, _) => out.push(name.clone()),
        RichDep::And(a, b)
        | RichDep::Or(a, b)
        | RichDep::With(a, b)
        | RichDep::Without(a, b) => {
            rich_leaf_names(a, out);
            rich_leaf_names(b, out);
        }
        RichDep::If { then, cond, orelse } | RichDep::Unless { then, cond, orelse } => {
            rich_leaf_names(then, out);
            rich_leaf_names(cond, out);
            if let Some(e) = orelse {
                rich_leaf_names(e, out);
            }
        }
    }
}

impl Pool {
    pub fn new(arch: &str, allowed_arches: Vec<String>) -> Pool {
        Pool {
            arch: arch.to_string(),
            allowed_arches,
            ..Default::default()
        }
    }

    pub fn arch_allowed(&self, arch: &str) -> bool {
        arch == "noarch" || self.allowed_arches.iter().any(|a| a == arch)
    }

    pub fn add_record(
        &mut self,
        record: PackageRecord,
        repo: RepoKind,
        media_name: &str,
        priority: i64,
        local_path: Option<PathBuf>,
    ) -> SolvableId {
        let id = self.solvables.len();

        let mut provides = parse_all(&record.provides);
        // versioned self-provide, essential for version comparisons
        provides.push(Dep::Versioned {
            name: record.name.clone(),
            op: RelOp::Eq,
            evr: record.evr(),
        });

        let deps = DepSet {
            provides,
            requires: parse_all(&record.requires),
            conflicts: parse_all(&record.conflicts),
            obsoletes: parse_all(&record.obsoletes),
            recommends: parse_all(&record.recommends),
            suggests: parse_all(&record.suggests),
        };

        self.by_name
            .entry(record.name.clone())
            .or_default()
            .push(id);

        self.solvables.push(Solvable {
            id,
            record,
            repo,
            media_name: media_name.to_string(),
            priority,
            local_path,
            deps,
        });
        id
    }

    /// Build the capability -> providers inverse index.
    pub fn create_whatprovides(&mut self) {
        self.whatprovides.clear();
        for solvable in &self.solvables {
            for dep in &solvable.deps.provides {
                match dep {
                    Dep::Simple(name) | Dep::Versioned { name, .. } => {
                        self.whatprovides
                            .entry(name.clone())
                            .or_default()
                            .push(solvable.id);
                    }
                    Dep::Rich(rich) => {
                        let mut names = Vec::new();
                        rich_leaf_names(rich, &mut names);
                        for name in names {
                            self.whatprovides.entry(name).or_default().push(solvable.id);
                        }
                    }
                }
            }
        }
        for ids in self.whatprovides.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
    }

    pub fn get(&self, id: SolvableId) -> &Solvable {
        &self.solvables[id]
    }

    pub fn installed(&self) -> impl Iterator<Item = &Solvable> {
        self.solvables
            .iter()
            .filter(|s| s.repo == RepoKind::Installed)
    }

    pub fn by_name(&self, name: &str) -> &[SolvableId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn provider_satisfies(&self, id: SolvableId, name: &str, constraint: Option<(RelOp, &str)>) -> bool {
        let solvable = self.get(id);
        for dep in &solvable.deps.provides {
            match dep {
                Dep::Simple(n) if n == name => {
                    // an unversioned provide satisfies any constraint
                    return true;
                }
                Dep::Versioned {
                    name: n,
                    op,
                    evr,
                } if n == name => match constraint {
                    None => return true,
                    Some((req_op, req_evr)) => {
                        if ranges_overlap(*op, evr, req_op, req_evr) {
                            return true;
                        }
                    }
                },
                Dep::Rich(rich) => {
                    let mut names = Vec::new();
                    rich_leaf_names(rich, &mut names);
                    if names.iter().any(|n| n == name) {
                        return true;
                    }
                }
                _ => (),
            }
        }
        false
    }

    /// Providers of a capability name with an optional version constraint.
    pub fn whatprovides(&self, name: &str, constraint: Option<(RelOp, &str)>) -> Vec<SolvableId> {
        let Some(candidates) = self.whatprovides.get(name) else {
            return Vec::new();
        };
        candidates
            .iter()
            .copied()
            .filter(|&id| self.provider_satisfies(id, name, constraint))
            .collect()
    }

    pub fn whatprovides_dep(&self, dep: &Dep) -> Vec<SolvableId> {
        match dep {
            Dep::Simple(name) => self.whatprovides(name, None),
            Dep::Versioned { name, op, evr } => self.whatprovides(name, Some((*op, evr))),
            Dep::Rich(rich) => {
                let mut names = Vec::new();
                rich_leaf_names(rich, &mut names);
                let mut ids: Vec<_> = names
                    .iter()
                    .flat_map(|n| self.whatprovides(n, None))
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        }
    }

    /// Installed packages requiring/recommending a capability name.
    pub fn whatmatchesdep<'a>(
        &'a self,
        name: &'a str,
        deps_of: impl Fn(&'a Solvable) -> &'a [Dep],
    ) -> Vec<SolvableId> {
        self.solvables
            .iter()
            .filter(|s| deps_of(s).iter().any(|d| d.name() == name))
            .map(|s| s.id)
            .collect()
    }

    /// Exact selection: name, canonical `name-evr.arch`, or `name.arch`.
    pub fn select_name(&self, arg: &str, installed_only: bool) -> Vec<SolvableId> {
        let mut ids: Vec<SolvableId> = self.by_name(arg).to_vec();

        if ids.is_empty() {
            // name.arch
            if let Some((name, arch)) = arg.rsplit_once('.') {
                ids = self
                    .by_name(name)
                    .iter()
                    .copied()
                    .filter(|&id| self.get(id).arch() == arch)
                    .collect();
            }
        }
        if ids.is_empty() {
            // canonical nevra
            ids = self
                .solvables
                .iter()
                .filter(|s| s.nevra() == arg)
                .map(|s| s.id)
                .collect();
        }
        self.filter_installed(ids, installed_only)
    }

    pub fn select_glob(&self, pattern: &str, installed_only: bool) -> Vec<SolvableId> {
        let Ok(glob) = GlobBuilder::new(pattern).build() else {
            return Vec::new();
        };
        let matcher = glob.compile_matcher();
        let ids = self
            .solvables
            .iter()
            .filter(|s| matcher.is_match(s.name()))
            .map(|s| s.id)
            .collect();
        self.filter_installed(ids, installed_only)
    }

    pub fn select_provides(&self, capability: &str, installed_only: bool) -> Vec<SolvableId> {
        let dep = parse_capability(capability);
        let ids = self.whatprovides_dep(&dep);
        self.filter_installed(ids, installed_only)
    }

    fn filter_installed(&self, ids: Vec<SolvableId>, installed_only: bool) -> Vec<SolvableId> {
        if installed_only {
            ids.into_iter()
                .filter(|&id| self.get(id).repo == RepoKind::Installed)
                .collect()
        } else {
            ids
        }
    }

    /// Compare two solvables by EVR.
    pub fn evr_cmp_ids(&self, a: SolvableId, b: SolvableId) -> Ordering {
        evr_cmp(&self.get(a).evr(), &self.get(b).evr())
    }

    /// Candidate ordering for the solver: higher priority first, then newer
    /// EVR, then same-arch before foreign arch, then name for determinism.
    pub fn preference_order(&self, ids: &mut Vec<SolvableId>) {
        let arch = self.arch.clone();
        ids.sort_by(|&a, &b| {
            let sa = self.get(a);
            let sb = self.get(b);
            sb.priority
                .cmp(&sa.priority)
                .then_with(|| evr_cmp(&sb.evr(), &sa.evr()))
                .then_with(|| (sb.arch() == arch).cmp(&(sa.arch() == arch)))
                .then_with(|| sa.name().cmp(sb.name()))
                .then_with(|| a.cmp(&b))
        });
    }
}

/// Strip version constraints from a capability string, keeping any
/// parenthesized namespace (`perl(Foo)` stays whole).
pub fn extract_cap_name(cap: &str) -> &str {
    let cap = match cap.find('[') {
        Some(idx) => &cap[..idx],
        None => cap,
    };
    match cap.find(" <") {
        Some(idx) => return cap[..idx].trim_end(),
        None => (),
    }
    match cap.find(" >") {
        Some(idx) => return cap[..idx].trim_end(),
        None => (),
    }
    match cap.find(" =") {
        Some(idx) => return cap[..idx].trim_end(),
        None => (),
    }
    cap.trim_end()
}
