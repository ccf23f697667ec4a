//! The balloon policy engine (spec §4.5): classification, the fill
//! chain, resize, shared-idle CPUs, assign/dismiss, and config-change
//! handling.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use allocator::{Priority, PriorityAllocator, TreeAllocator, TreeAllocatorOptions};
use cpuset::CpuSet;
use interfaces::{ContainerCache, ContainerInfo, CpuClassApplier, Pinner};
use log::{debug, info, warn};
use topology::{CpuTree, TopologyLevel, WalkControl};

use crate::definition::{BalloonDefinition, DEFAULT_BALLOON, RESERVED_BALLOON};
use crate::error::PolicyError;
use crate::instance::BalloonInstance;
use crate::options::{BalloonPolicyOptions, ReservedCpuSpec};

/// Built-in policy-list positions (spec §3: "always occupy indices 0 and 1").
const RESERVED_IDX: usize = 0;
const DEFAULT_IDX: usize = 1;

/// One step of a definition's fill chain (spec §4.5's table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillStep {
    SamePod,
    SameNamespace,
    Balanced,
    BalancedInflate,
    NewBalloon,
}

/// Owns the set of balloons, classifies incoming containers, drives
/// their placement, and issues pin actions (spec §4.5).
pub struct BalloonPolicy {
    name: String,
    annotation_namespace: String,
    tree: CpuTree,
    options: BalloonPolicyOptions,
    allowed: CpuSet,
    reserved: CpuSet,
    free: CpuSet,
    /// Whether the default balloon still aliases the reserved set (spec
    /// §3: true until the user gives it a nonzero `minCpus`/`maxCpus`).
    default_aliased: bool,
    priority_allocator: PriorityAllocator,
    tree_allocator_cache: RefCell<HashMap<(bool, bool), Rc<TreeAllocator>>>,
    definitions: Vec<Rc<BalloonDefinition>>,
    balloons: Vec<BalloonInstance>,
    container_cache: Box<dyn ContainerCache>,
    cpu_class_applier: Box<dyn CpuClassApplier>,
    pinner: Box<dyn Pinner>,
}

/// The freshly computed pieces of policy state produced by [`build_state`],
/// used both by [`BalloonPolicy::new`] and by a full config rebuild.
struct BuiltState {
    definitions: Vec<Rc<BalloonDefinition>>,
    balloons: Vec<BalloonInstance>,
    free: CpuSet,
    reserved: CpuSet,
    default_aliased: bool,
}

impl BalloonPolicy {
    pub fn new(
        tree: CpuTree,
        options: BalloonPolicyOptions,
        name: impl Into<String>,
        annotation_namespace: impl Into<String>,
        container_cache: Box<dyn ContainerCache>,
        cpu_class_applier: Box<dyn CpuClassApplier>,
        pinner: Box<dyn Pinner>,
    ) -> Result<Self, PolicyError> {
        let name = name.into();
        validate_options(&options)?;
        let built = build_state(&tree, &options)?;
        let allowed = options.allowed_cpus.clone().unwrap_or_else(|| tree.cpus().clone());
        let priority_allocator = PriorityAllocator::new(tree.clone());

        info!(
            target: "balloon_policy",
            "starting policy {:?}: allowed={}, reserved={}, {} balloons",
            name,
            allowed,
            built.reserved,
            built.balloons.len()
        );

        let mut policy = BalloonPolicy {
            name,
            annotation_namespace: annotation_namespace.into(),
            tree,
            reserved: built.reserved.clone(),
            allowed,
            free: built.free,
            default_aliased: built.default_aliased,
            priority_allocator,
            tree_allocator_cache: RefCell::new(HashMap::new()),
            definitions: built.definitions,
            balloons: built.balloons,
            container_cache,
            cpu_class_applier,
            pinner,
            options,
        };
        policy.apply_all_cpu_classes();
        Ok(policy)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BalloonPolicyOptions {
        &self.options
    }

    pub fn allowed_cpus(&self) -> &CpuSet {
        &self.allowed
    }

    pub fn reserved_cpus(&self) -> &CpuSet {
        &self.reserved
    }

    pub fn free_cpus(&self) -> &CpuSet {
        &self.free
    }

    pub fn balloons(&self) -> &[BalloonInstance] {
        &self.balloons
    }

    pub fn definitions(&self) -> &[Rc<BalloonDefinition>] {
        &self.definitions
    }

    /// Sum of `milliCpu` across every container currently assigned to the
    /// balloon at `index` (spec §6's "total requested milli-CPU" metric).
    /// Panics if `index` is out of range, like every other `usize`-indexed
    /// accessor here; callers iterate [`Self::balloons`] to get valid ones.
    pub fn balloon_requested_milli_cpu(&self, index: usize) -> u64 {
        self.requested_milli_cpu_sum(index)
    }

    // -- classification (spec §4.5) -----------------------------------

    fn annotation_key(&self) -> String {
        format!("balloon.{}.{}", self.name, self.annotation_namespace)
    }

    fn is_reserved_namespace(&self, namespace: &str) -> bool {
        namespace == "kube-system" || self.options.reserved_pool_namespaces.iter().any(|pattern| namespace_matches(pattern, namespace))
    }

    fn definition_by_name(&self, name: &str) -> Option<Rc<BalloonDefinition>> {
        self.definitions.iter().find(|d| d.name == name).cloned()
    }

    pub fn classify(&self, container: &ContainerInfo) -> Result<Rc<BalloonDefinition>, PolicyError> {
        let key = self.annotation_key();
        if let Some(requested) = container.annotations.get(&key) {
            return self
                .definition_by_name(requested)
                .ok_or_else(|| PolicyError::UnknownAnnotation { name: requested.clone() });
        }
        if self.is_reserved_namespace(&container.namespace) {
            return Ok(self.definitions[RESERVED_IDX].clone());
        }
        for def in &self.definitions {
            if def.namespaces.iter().any(|pattern| namespace_matches(pattern, &container.namespace)) {
                return Ok(def.clone());
            }
        }
        Ok(self.definitions[DEFAULT_IDX].clone())
    }

    // -- fill chain (spec §4.5) -----------------------------------------

    fn fill_chain(def: &BalloonDefinition) -> Vec<FillStep> {
        let mut chain = Vec::new();
        if !def.prefer_spreading_pods {
            chain.push(FillStep::SamePod);
        }
        if def.prefer_per_namespace_balloon {
            chain.push(FillStep::SameNamespace);
            chain.push(FillStep::NewBalloon);
        }
        if def.prefer_new_balloons {
            chain.push(FillStep::NewBalloon);
            chain.push(FillStep::Balanced);
            chain.push(FillStep::BalancedInflate);
        } else {
            chain.push(FillStep::Balanced);
            chain.push(FillStep::BalancedInflate);
            chain.push(FillStep::NewBalloon);
        }
        chain
    }

    /// Picks which balloon-list index a container lands in, given its
    /// classified definition (spec §4.5). Built-in definitions resolve
    /// directly to their single instance; user definitions run the fill
    /// chain, ending in a `new-balloon-must` when the chain's last step
    /// is itself `new-balloon` (spec §9's open question: that ordering
    /// is what makes rollback-before-error meaningful).
    fn choose_instance(&mut self, def: &Rc<BalloonDefinition>, container: &ContainerInfo) -> Result<usize, PolicyError> {
        if Rc::ptr_eq(def, &self.definitions[RESERVED_IDX]) {
            return Ok(RESERVED_IDX);
        }
        if Rc::ptr_eq(def, &self.definitions[DEFAULT_IDX]) {
            return Ok(DEFAULT_IDX);
        }

        let chain = Self::fill_chain(def);
        let last_is_new_balloon = matches!(chain.last(), Some(FillStep::NewBalloon));
        let last = chain.len().saturating_sub(1);

        for (i, step) in chain.iter().enumerate() {
            let must = i == last && last_is_new_balloon && *step == FillStep::NewBalloon;
            let result = match step {
                FillStep::SamePod => Ok(self.fill_same_pod(def, container)),
                FillStep::SameNamespace => Ok(self.fill_same_namespace(def, container)),
                FillStep::Balanced => Ok(self.fill_balanced(def, container)),
                FillStep::BalancedInflate => Ok(self.fill_balanced_inflate(def, container)),
                FillStep::NewBalloon => self.fill_new_balloon(def, container, must),
            };
            match result {
                Ok(Some(idx)) => return Ok(idx),
                Ok(None) => continue,
                Err(err) if must => return Err(err),
                Err(err) => {
                    warn!(target: "balloon_policy", "fill step {step:?} for {:?} failed, trying next: {err}", def.name);
                    continue;
                }
            }
        }
        Err(PolicyError::NoSuitableBalloon { definition: def.name.clone() })
    }

    fn instances_of(&self, def: &Rc<BalloonDefinition>) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .balloons
            .iter()
            .enumerate()
            .filter(|(_, b)| Rc::ptr_eq(b.definition(), def))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| self.balloons[i].index());
        indices
    }

    fn fill_same_pod(&self, def: &Rc<BalloonDefinition>, container: &ContainerInfo) -> Option<usize> {
        self.instances_of(def)
            .into_iter()
            .find(|&idx| self.balloons[idx].has_pod(&container.pod_id) && self.max_free_milli_cpu(idx) >= container.milli_cpu)
    }

    fn fill_same_namespace(&self, def: &Rc<BalloonDefinition>, container: &ContainerInfo) -> Option<usize> {
        self.instances_of(def).into_iter().find(|&idx| {
            let in_namespace = self
                .balloons[idx]
                .containers()
                .iter()
                .filter_map(|id| self.container_cache.get(id))
                .any(|c| c.namespace == container.namespace);
            in_namespace && self.max_free_milli_cpu(idx) >= container.milli_cpu
        })
    }

    fn fill_balanced(&self, def: &Rc<BalloonDefinition>, container: &ContainerInfo) -> Option<usize> {
        let best = self
            .instances_of(def)
            .into_iter()
            .max_by_key(|&idx| self.free_milli_cpu(idx))?;
        (self.free_milli_cpu(best) >= container.milli_cpu).then_some(best)
    }

    fn fill_balanced_inflate(&self, def: &Rc<BalloonDefinition>, container: &ContainerInfo) -> Option<usize> {
        let best = self
            .instances_of(def)
            .into_iter()
            .max_by_key(|&idx| self.max_free_milli_cpu(idx))?;
        (self.max_free_milli_cpu(best) >= container.milli_cpu).then_some(best)
    }

    /// `new-balloon` / `new-balloon-must` (spec §4.5): reuse an empty
    /// existing instance if one exists, else create a fresh one sized to
    /// `minCpus`. `must` turns a hit of `maxBalloons` into a hard error
    /// instead of a silent `None`; any other failure always returns
    /// `Ok(None)` so the caller's fallback is a uniform "no suitable
    /// balloon" rather than a menagerie of allocator-specific errors
    /// (spec §7).
    fn fill_new_balloon(&mut self, def: &Rc<BalloonDefinition>, container: &ContainerInfo, must: bool) -> Result<Option<usize>, PolicyError> {
        let existing = self.instances_of(def).len() as u32;
        if let Some(max) = def.max_balloons_bound() {
            if existing >= max {
                if must {
                    return Err(PolicyError::MaxBalloonsReached { definition: def.name.clone() });
                }
                return Ok(None);
            }
        }

        if let Some(idx) = self.instances_of(def).into_iter().find(|&idx| self.balloons[idx].is_empty()) {
            return Ok(Some(idx));
        }

        let next_index = self.next_instance_index(def);
        let allocator = self.tree_allocator_for(def);
        let allocation = (|| -> Result<CpuSet, PolicyError> {
            if def.min_cpus == 0 {
                return Ok(CpuSet::new());
            }
            let add_from = allocator.recommend(&CpuSet::new(), &self.free, def.min_cpus as i64)?;
            Ok(self.priority_allocator.allocate(&add_from, def.min_cpus as usize, def.priority.into())?)
        })();

        let cpus = match allocation {
            Ok(cpus) => cpus,
            Err(err) if must => return Err(err),
            Err(_) => return Ok(None),
        };

        let mut instance = BalloonInstance::new(def.clone(), next_index, cpus.clone());
        instance.set_mem_nodes(closest_mem_nodes(&self.tree, &cpus));

        if instance.max_avail_milli_cpu().map_or(false, |max| max < container.milli_cpu) {
            // Rolling back before reporting failure matters: the CPUs
            // must return to `free` before any error is surfaced, never
            // after (spec §9's open question).
            self.free.union_in_place(&cpus);
            return Ok(None);
        }

        self.free.difference_in_place(&cpus);
        self.cpu_class_applier.assign(&def.cpu_class, &cpus);
        self.balloons.push(instance);
        let idx = self.balloons.len() - 1;
        self.reshare_idle();
        Ok(Some(idx))
    }

    fn next_instance_index(&self, def: &Rc<BalloonDefinition>) -> u32 {
        let used: BTreeSet<u32> = self.balloons.iter().filter(|b| Rc::ptr_eq(b.definition(), def)).map(|b| b.index()).collect();
        let mut idx = 0;
        while used.contains(&idx) {
            idx += 1;
        }
        idx
    }

    // -- capacity accounting ---------------------------------------------

    fn requested_milli_cpu_sum(&self, idx: usize) -> u64 {
        self.balloons[idx]
            .containers()
            .iter()
            .filter_map(|id| self.container_cache.get(id))
            .map(|c| c.milli_cpu)
            .sum()
    }

    fn free_milli_cpu(&self, idx: usize) -> u64 {
        self.balloons[idx].avail_milli_cpu().saturating_sub(self.requested_milli_cpu_sum(idx))
    }

    fn max_free_milli_cpu(&self, idx: usize) -> u64 {
        let max = self.balloons[idx].max_avail_milli_cpu().unwrap_or(u64::MAX);
        max.saturating_sub(self.requested_milli_cpu_sum(idx))
    }

    fn is_fixed(&self, idx: usize) -> bool {
        idx == RESERVED_IDX || (idx == DEFAULT_IDX && self.default_aliased)
    }

    // -- resize / inflate / deflate (spec §4.5) --------------------------

    fn tree_allocator_for(&self, def: &BalloonDefinition) -> Rc<TreeAllocator> {
        let opts = resolve_tree_options(&self.options, def);
        let key = (opts.topology_balancing, opts.prefer_spread_on_physical_cores);
        if let Some(existing) = self.tree_allocator_cache.borrow().get(&key) {
            return existing.clone();
        }
        let allocator = Rc::new(TreeAllocator::new(self.tree.clone(), opts));
        self.tree_allocator_cache.borrow_mut().insert(key, allocator.clone());
        allocator
    }

    /// Resizes a balloon to the CPU count that covers `target_milli_cpu`,
    /// clamped to `[minCpus, maxCpus]`. A no-op for the reserved balloon,
    /// and for the default balloon while it still aliases the reserved
    /// set (spec §4.5).
    fn resize(&mut self, idx: usize, target_milli_cpu: u64) -> Result<(), PolicyError> {
        if self.is_fixed(idx) {
            return Ok(());
        }
        let def = self.balloons[idx].definition().clone();
        let target_cpus = def.clamp_cpus(milli_cpu_to_cpu_count(target_milli_cpu));
        let current = self.balloons[idx].cpus().clone();
        let current_cpus = current.len() as u32;
        if target_cpus == current_cpus {
            return Ok(());
        }
        let delta = target_cpus as i64 - current_cpus as i64;
        let allocator = self.tree_allocator_for(&def);

        if delta > 0 {
            let add_from = allocator.recommend(&current, &self.free, delta)?;
            let taken = self.priority_allocator.allocate(&add_from, delta as usize, def.priority.into())?;
            self.free.difference_in_place(&taken);
            self.balloons[idx].set_cpus(current.union(&taken));
        } else {
            let remove_from = allocator.recommend(&current, &self.free, delta)?;
            let kept = self.priority_allocator.release(&remove_from, (-delta) as usize, def.priority.into())?;
            let released = remove_from.difference(&kept);
            self.free.union_in_place(&released);
            self.balloons[idx].set_cpus(current.difference(&released));
        }

        let mem_nodes = closest_mem_nodes(&self.tree, self.balloons[idx].cpus());
        self.balloons[idx].set_mem_nodes(mem_nodes);
        debug!(target: "balloon_policy", "resized {} to {} CPUs", self.balloons[idx].pretty_name(), self.balloons[idx].cpus());
        self.reshare_idle();
        self.pin_balloon_containers(idx);
        Ok(())
    }

    /// Fully deflates and removes a balloon, bypassing `minCpus` (the
    /// balloon is being destroyed, not resized within its own bounds).
    fn delete_balloon(&mut self, idx: usize) -> Result<(), PolicyError> {
        let def = self.balloons[idx].definition().clone();
        let cpus = self.balloons[idx].cpus().clone();
        if !cpus.is_empty() {
            let allocator = self.tree_allocator_for(&def);
            let remove_from = allocator.recommend(&cpus, &self.free, -(cpus.len() as i64))?;
            let kept = self.priority_allocator.release(&remove_from, remove_from.len(), def.priority.into())?;
            if !kept.is_empty() {
                return Err(PolicyError::InternalInvariant(format!(
                    "deleting {} left {} CPUs unreleased",
                    self.balloons[idx].pretty_name(),
                    kept
                )));
            }
            self.free.union_in_place(&remove_from);
        }
        info!(target: "balloon_policy", "deleted empty balloon {}", self.balloons[idx].pretty_name());
        self.balloons.remove(idx);
        self.reshare_idle();
        Ok(())
    }

    // -- shared-idle CPUs (spec §4.5) ------------------------------------

    fn reshare_idle(&mut self) {
        for idx in 0..self.balloons.len() {
            let Some(level) = self.balloons[idx].definition().share_idle_cpus_in_same else {
                continue;
            };
            let exclusive = self.balloons[idx].cpus().clone();
            let shared = compute_shared_idle(&self.tree, level, &exclusive, &self.free);
            if shared != *self.balloons[idx].shared_idle() {
                self.balloons[idx].set_shared_idle(shared);
                self.pin_balloon_containers(idx);
            }
        }
    }

    // -- pinning ----------------------------------------------------------

    fn pin_balloon_containers(&self, idx: usize) {
        let balloon = &self.balloons[idx];
        let cpus = balloon.pinned_cpus();
        let mems = balloon.mem_nodes().clone();
        for container_id in balloon.containers() {
            if self.options.pin_cpu {
                self.pinner.set_cpuset_cpus(&container_id, &cpus);
            }
            if self.options.pin_memory {
                self.pinner.set_cpuset_mems(&container_id, &mems);
            }
            if let Some(container) = self.container_cache.get(&container_id) {
                self.pinner.set_cpu_shares(&container_id, container.milli_cpu);
            }
        }
    }

    fn apply_all_cpu_classes(&mut self) {
        for idx in 0..self.balloons.len() {
            let class = self.balloons[idx].definition().cpu_class.clone();
            self.cpu_class_applier.assign(&class, &self.balloons[idx].cpus().clone());
        }
        self.cpu_class_applier.assign(&self.options.idle_cpu_class, &self.free);
    }

    // -- assign / dismiss (spec §4.5) ------------------------------------

    fn find_balloon_with_container(&self, container_id: &str) -> Option<usize> {
        self.balloons.iter().position(|b| b.containers().iter().any(|c| c == container_id))
    }

    /// Allocates a container: classifies it, picks an instance via the
    /// fill chain, inflates that instance to cover the new request, and
    /// assigns the container (spec §4.5 "Assign").
    pub fn allocate_resources(&mut self, container: &ContainerInfo) -> Result<(), PolicyError> {
        if self.find_balloon_with_container(&container.id).is_some() {
            return Err(PolicyError::InternalInvariant(format!("container {:?} is already assigned", container.id)));
        }
        let def = self.classify(container)?;
        let idx = self.choose_instance(&def, container)?;
        let target = self.requested_milli_cpu_sum(idx) + container.milli_cpu;
        self.resize(idx, target)?;
        self.balloons[idx].add_container(&container.pod_id, &container.id);
        self.pin_balloon_containers(idx);
        Ok(())
    }

    /// Releases a container: removes it from its balloon's pod map,
    /// deflates (and possibly deletes) the balloon (spec §4.5 "Dismiss").
    pub fn release_resources(&mut self, container_id: &str) -> Result<(), PolicyError> {
        let idx = self
            .find_balloon_with_container(container_id)
            .ok_or_else(|| PolicyError::UnknownContainer(container_id.to_string()))?;
        if !self.balloons[idx].remove_container(container_id) {
            return Err(PolicyError::InternalInvariant(format!("container {container_id:?} missing from its balloon's pod map")));
        }

        if idx >= 2 && self.balloons[idx].is_empty() {
            let def = self.balloons[idx].definition().clone();
            let instance_count = self.instances_of(&def).len() as u32;
            if instance_count > def.min_balloons {
                return self.delete_balloon(idx);
            }
        }

        let target = self.requested_milli_cpu_sum(idx);
        self.resize(idx, target)
    }

    /// Applies a batch of releases and allocations. Releases are applied
    /// before allocations so freed CPUs are immediately available to the
    /// new allocations (spec §5).
    pub fn sync(&mut self, releases: &[String], allocations: &[ContainerInfo]) -> Result<(), PolicyError> {
        for container_id in releases {
            self.release_resources(container_id)?;
        }
        for container in allocations {
            self.allocate_resources(container)?;
        }
        Ok(())
    }

    // -- config reload (spec §4.5, §9) ------------------------------------

    /// Applies a reconfiguration. If only `cpuClass` strings differ, the
    /// definitions are patched in place; otherwise the whole policy
    /// state is rebuilt from scratch and every currently-assigned
    /// container is resynchronized into it (spec §4.5).
    pub fn config_notify(&mut self, new_options: BalloonPolicyOptions) -> Result<(), PolicyError> {
        validate_options(&new_options)?;

        if options_equal_ignoring_cpu_class(&self.options, &new_options) {
            self.apply_cpu_class_patch(&new_options);
            self.options = new_options;
            return Ok(());
        }

        info!(target: "balloon_policy", "rebuilding policy {:?} for a non-trivial config change", self.name);
        let assigned: Vec<ContainerInfo> = self
            .balloons
            .iter()
            .flat_map(|b| b.containers())
            .filter_map(|id| self.container_cache.get(&id))
            .collect();

        let built = build_state(&self.tree, &new_options)?;
        self.definitions = built.definitions;
        self.balloons = built.balloons;
        self.free = built.free;
        self.reserved = built.reserved;
        self.default_aliased = built.default_aliased;
        self.options = new_options;
        self.tree_allocator_cache.borrow_mut().clear();
        self.apply_all_cpu_classes();

        for container in assigned {
            self.allocate_resources(&container)?;
        }
        Ok(())
    }

    fn apply_cpu_class_patch(&mut self, new_options: &BalloonPolicyOptions) {
        let mut patched = Vec::with_capacity(self.definitions.len());
        for def in &self.definitions {
            let mut updated = (**def).clone();
            if let Some(new_def) = new_options.balloon_types.iter().find(|d| d.name == updated.name) {
                updated.cpu_class = new_def.cpu_class.clone();
            }
            patched.push(Rc::new(updated));
        }
        for balloon in &mut self.balloons {
            if let Some(updated) = patched.iter().find(|d| d.name == balloon.definition().name) {
                balloon.set_definition(updated.clone());
            }
        }
        self.definitions = patched;
        self.apply_all_cpu_classes();
    }
}

fn resolve_tree_options(policy_options: &BalloonPolicyOptions, def: &BalloonDefinition) -> TreeAllocatorOptions {
    TreeAllocatorOptions {
        topology_balancing: def.allocator_topology_balancing.unwrap_or(policy_options.allocator_topology_balancing),
        prefer_spread_on_physical_cores: def.prefer_spread_on_physical_cores.unwrap_or(policy_options.prefer_spread_on_physical_cores),
    }
}

fn milli_cpu_to_cpu_count(milli_cpu: u64) -> u32 {
    ((milli_cpu + 999) / 1000) as u32
}

fn namespace_matches(pattern: &str, namespace: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(namespace)).unwrap_or(false)
}

/// The NUMA nodes a CPU set touches (spec §3: "closest memory nodes
/// covering the CPU set"). Reuses [`CpuSet`] as a bag of NUMA node ids,
/// not CPU ids — the two id spaces are both `CpuId` (spec §3: "a small
/// unsigned integer identifies every logical CPU, core, NUMA node, die,
/// and package").
fn closest_mem_nodes(tree: &CpuTree, cpus: &CpuSet) -> CpuSet {
    let mut out = CpuSet::new();
    tree.walk(&mut |node| {
        if node.level() == TopologyLevel::NUMA {
            if !node.cpus().intersection(cpus).is_empty() {
                out.insert(node.id());
            }
            return WalkControl::SkipChildren;
        }
        WalkControl::Continue
    });
    out
}

/// Shared-idle computation (spec §4.5): at `level`, every subtree whose
/// CPU set intersects `exclusive` contributes its intersection with
/// `free` to the result.
fn compute_shared_idle(tree: &CpuTree, level: TopologyLevel, exclusive: &CpuSet, free: &CpuSet) -> CpuSet {
    let mut out = CpuSet::new();
    tree.walk(&mut |node| {
        if node.level() == level {
            if !node.cpus().intersection(exclusive).is_empty() {
                out.union_in_place(&node.cpus().intersection(free));
            }
            return WalkControl::SkipChildren;
        }
        WalkControl::Continue
    });
    out
}

fn resolve_reserved(allowed: &CpuSet, spec: &ReservedCpuSpec, priority_allocator: &PriorityAllocator) -> Result<CpuSet, PolicyError> {
    match spec {
        ReservedCpuSpec::Explicit(set) => Ok(set.intersection(allowed)),
        ReservedCpuSpec::MilliCpu(milli_cpu) => {
            let count = milli_cpu_to_cpu_count(*milli_cpu) as usize;
            Ok(priority_allocator.allocate(allowed, count, Priority::NONE)?)
        }
    }
}

/// Pure validation: per-definition bound checks that must be rejected
/// before any running state is touched (spec §4.5, §7).
fn validate_options(options: &BalloonPolicyOptions) -> Result<(), PolicyError> {
    for def in &options.balloon_types {
        if def.name == RESERVED_BALLOON {
            return Err(PolicyError::ConfigurationInvalid("balloon type name \"reserved\" is built in".to_string()));
        }
        if let Some(max) = def.max_cpus_bound() {
            if def.min_cpus > max {
                return Err(PolicyError::ConfigurationInvalid(format!("{}: minCpus > maxCpus", def.name)));
            }
        }
        if let Some(max) = def.max_balloons_bound() {
            if def.min_balloons > max {
                return Err(PolicyError::ConfigurationInvalid(format!("{}: minBalloons > maxBalloons", def.name)));
            }
        }
    }
    Ok(())
}

/// Whether two option sets are identical apart from `idleCpuClass` and
/// every balloon type's `cpuClass` (spec §4.5's "Config change" fast path).
fn options_equal_ignoring_cpu_class(a: &BalloonPolicyOptions, b: &BalloonPolicyOptions) -> bool {
    fn strip(options: &BalloonPolicyOptions) -> BalloonPolicyOptions {
        let mut options = options.clone();
        options.idle_cpu_class.clear();
        for def in &mut options.balloon_types {
            def.cpu_class.clear();
        }
        options
    }
    strip(a) == strip(b)
}

/// Constructs the definitions/balloons/free-CPU triple for a fresh start
/// or a full config rebuild (spec §4.5 "Startup"). Never mutates an
/// existing [`BalloonPolicy`]; the caller only installs the result once
/// it has been produced successfully.
fn build_state(tree: &CpuTree, options: &BalloonPolicyOptions) -> Result<BuiltState, PolicyError> {
    let allowed = options.allowed_cpus.clone().unwrap_or_else(|| tree.cpus().clone());
    let priority_allocator = PriorityAllocator::new(tree.clone());
    let reserved = resolve_reserved(&allowed, &options.reserved, &priority_allocator)?;
    let mut free = allowed.difference(&reserved);

    let mut definitions = vec![Rc::new(BalloonDefinition::reserved()), Rc::new(BalloonDefinition::default_balloon())];
    for raw in &options.balloon_types {
        if raw.name == DEFAULT_BALLOON {
            definitions[DEFAULT_IDX] = Rc::new(raw.clone());
        } else {
            definitions.push(Rc::new(raw.clone()));
        }
    }

    let default_def = definitions[DEFAULT_IDX].clone();
    let default_aliased = default_def.min_cpus == 0 && default_def.max_cpus == 0;

    let mut balloons = Vec::new();
    balloons.push(BalloonInstance::new(definitions[RESERVED_IDX].clone(), 0, reserved.clone()));
    balloons.push(BalloonInstance::new(
        default_def.clone(),
        0,
        if default_aliased { reserved.clone() } else { CpuSet::new() },
    ));

    for def in definitions.iter().skip(2) {
        let allocator = TreeAllocator::new(tree.clone(), resolve_tree_options(options, def));
        for instance_index in 0..def.min_balloons {
            let cpus = if def.min_cpus > 0 {
                let add_from = allocator.recommend(&CpuSet::new(), &free, def.min_cpus as i64)?;
                let taken = priority_allocator.allocate(&add_from, def.min_cpus as usize, def.priority.into())?;
                free.difference_in_place(&taken);
                taken
            } else {
                CpuSet::new()
            };
            let mut instance = BalloonInstance::new(def.clone(), instance_index, cpus.clone());
            instance.set_mem_nodes(closest_mem_nodes(tree, &cpus));
            balloons.push(instance);
        }
    }

    if !default_aliased && default_def.min_cpus > 0 {
        let allocator = TreeAllocator::new(tree.clone(), resolve_tree_options(options, &default_def));
        let add_from = allocator.recommend(&CpuSet::new(), &free, default_def.min_cpus as i64)?;
        let taken = priority_allocator.allocate(&add_from, default_def.min_cpus as usize, default_def.priority.into())?;
        free.difference_in_place(&taken);
        balloons[DEFAULT_IDX].set_cpus(taken);
    }

    balloons[RESERVED_IDX].set_mem_nodes(closest_mem_nodes(tree, &reserved));
    let default_cpus = balloons[DEFAULT_IDX].cpus().clone();
    balloons[DEFAULT_IDX].set_mem_nodes(closest_mem_nodes(tree, &default_cpus));

    for idx in 0..balloons.len() {
        if let Some(level) = balloons[idx].definition().share_idle_cpus_in_same {
            let exclusive = balloons[idx].cpus().clone();
            let shared = compute_shared_idle(tree, level, &exclusive, &free);
            balloons[idx].set_shared_idle(shared);
        }
    }

    Ok(BuiltState { definitions, balloons, free, reserved, default_aliased })
}
