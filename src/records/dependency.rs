//! Class-hierarchy assumptions recorded by the compiler
//!
//! Arguments are 1-based metadata-array indices. Index 0 stands for the
//! implicit context class, which is derived from the following argument:
//! the holder of a method, or the class itself.

use crate::vm::{ClassHierarchy, ClassResolver, KlassHandle, MetaRef, MethodHandle, RuntimeEnv};
use crate::{Error, Result};
use rustc_hash::FxHashSet as HashSet;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Kind of recorded assumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DepType {
    /// Method has not been replaced by redefinition
    EvolMethod,
    /// Class has no subclasses
    LeafType,
    /// Abstract context has exactly one concrete subtype
    AbstractWithUniqueConcreteSubtype,
    AbstractWithNoConcreteSubtype,
    ConcreteWithNoConcreteSubtype,
    /// Method is the only concrete implementation below the context
    UniqueConcreteMethod,
    AbstractWithExclusiveConcreteSubtypes2,
    ExclusiveConcreteMethods2,
    NoFinalizableSubclasses,
    /// Mutable call site target; never valid in a cache
    CallSiteTargetValue,
}

impl DepType {
    pub fn name(self) -> &'static str {
        match self {
            DepType::EvolMethod => "evol_method",
            DepType::LeafType => "leaf_type",
            DepType::AbstractWithUniqueConcreteSubtype => "abstract_with_unique_concrete_subtype",
            DepType::AbstractWithNoConcreteSubtype => "abstract_with_no_concrete_subtype",
            DepType::ConcreteWithNoConcreteSubtype => "concrete_with_no_concrete_subtype",
            DepType::UniqueConcreteMethod => "unique_concrete_method",
            DepType::AbstractWithExclusiveConcreteSubtypes2 => "abstract_with_exclusive_concrete_subtypes_2",
            DepType::ExclusiveConcreteMethods2 => "exclusive_concrete_methods_2",
            DepType::NoFinalizableSubclasses => "no_finalizable_subclasses",
            DepType::CallSiteTargetValue => "call_site_target_value",
        }
    }

    /// Whether the first argument is a context class that may be implicit
    pub fn has_context(self) -> bool {
        !matches!(self, DepType::EvolMethod | DepType::CallSiteTargetValue)
    }
}

impl fmt::Display for DepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub dep_type: DepType,
    pub args: Vec<u32>,
}

/// Dependency argument in a form comparable across files
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DepKey<K> {
    Implicit,
    Meta(K),
}

impl DependencyRecord {
    pub fn new(dep_type: DepType, args: Vec<u32>) -> Self {
        Self { dep_type, args }
    }

    /// Rewrite 1-based blob indices through `dest`; 0 stays implicit
    pub fn remap(&self, dest: &[u32]) -> Result<DependencyRecord> {
        let args = self
            .args
            .iter()
            .map(|&idx| {
                if idx == 0 {
                    return Ok(0);
                }
                dest.get(idx as usize - 1).copied().ok_or_else(|| {
                    Error::corruption(format!(
                        "dependency index {} outside metadata array of {}",
                        idx,
                        dest.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DependencyRecord::new(self.dep_type, args))
    }

    /// Arguments mapped through `key`, for ordering and set comparison
    pub fn normalized<K>(&self, key: &dyn Fn(u32) -> K) -> (DepType, Vec<DepKey<K>>) {
        let args = self
            .args
            .iter()
            .map(|&idx| if idx == 0 { DepKey::Implicit } else { DepKey::Meta(key(idx)) })
            .collect();
        (self.dep_type, args)
    }

    /// Order by type, argument count, then per argument (implicit first)
    pub fn compare_by<K: Ord>(&self, other: &DependencyRecord, key: &dyn Fn(u32) -> K) -> Ordering {
        let (t1, a1) = self.normalized(key);
        let (t2, a2) = other.normalized(key);
        t1.cmp(&t2)
            .then(a1.len().cmp(&a2.len()))
            .then_with(|| a1.cmp(&a2))
    }

    pub fn describe(&self, name: &dyn Fn(u32) -> String) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|&idx| if idx == 0 { "<implicit>".to_string() } else { name(idx) })
            .collect();
        format!("{} {}", self.dep_type, args.join(" "))
    }

    /// Re-check the assumption against the live class hierarchy.
    ///
    /// `metas` is the resolved metadata array of the version.
    pub fn check(&self, metas: &[Option<MetaRef>], env: &dyn RuntimeEnv) -> Result<()> {
        let checker = Checker { metas, env };
        let holds = checker.holds(self)?;
        if holds {
            Ok(())
        } else {
            Err(Error::DependencyViolated(format!(
                "{} over {:?}",
                self.dep_type, self.args
            )))
        }
    }
}

struct Checker<'a> {
    metas: &'a [Option<MetaRef>],
    env: &'a dyn RuntimeEnv,
}

impl Checker<'_> {
    fn meta(&self, idx: u32) -> Result<MetaRef> {
        idx.checked_sub(1)
            .and_then(|i| self.metas.get(i as usize))
            .copied()
            .flatten()
            .ok_or_else(|| Error::corruption(format!("dependency index {} has no metadata", idx)))
    }

    fn klass_arg(&self, args: &[u32], pos: usize) -> Result<KlassHandle> {
        let idx = *args
            .get(pos)
            .ok_or_else(|| Error::corruption(format!("dependency missing argument {}", pos)))?;
        if idx == 0 {
            // Implicit context comes from the next argument
            let next = self.meta(*args.get(pos + 1).ok_or_else(|| {
                Error::corruption("implicit dependency context without a following argument")
            })?)?;
            return Ok(match next {
                MetaRef::Klass(k) => k,
                MetaRef::Method(m) => self.env.method_holder(m),
            });
        }
        self.meta(idx)?
            .as_klass()
            .ok_or_else(|| Error::corruption(format!("dependency argument {} is not a class", idx)))
    }

    fn method_arg(&self, args: &[u32], pos: usize) -> Result<MethodHandle> {
        let idx = *args
            .get(pos)
            .ok_or_else(|| Error::corruption(format!("dependency missing argument {}", pos)))?;
        self.meta(idx)?
            .as_method()
            .ok_or_else(|| Error::corruption(format!("dependency argument {} is not a method", idx)))
    }

    /// `ctx` and every class below it
    fn subtree(&self, ctx: KlassHandle) -> Vec<KlassHandle> {
        let mut seen = HashSet::default();
        let mut out = Vec::new();
        let mut stack = vec![ctx];
        while let Some(k) = stack.pop() {
            if !seen.insert(k) {
                continue;
            }
            out.push(k);
            stack.extend(self.env.subclasses(k));
        }
        out
    }

    fn is_concrete(&self, k: KlassHandle) -> bool {
        !self.env.is_abstract(k) && !self.env.is_interface(k)
    }

    fn concrete_subtypes(&self, ctx: KlassHandle) -> Vec<KlassHandle> {
        self.subtree(ctx).into_iter().filter(|k| self.is_concrete(*k)).collect()
    }

    /// Concrete implementations of `m`'s name and signature in `ctx`'s subtree
    fn concrete_methods(&self, ctx: KlassHandle, m: MethodHandle) -> Vec<MethodHandle> {
        let name = self.env.method_name(m);
        let sig = self.env.method_signature(m);
        self.subtree(ctx)
            .into_iter()
            .filter_map(|k| self.env.declared_method(k, &name, &sig))
            .filter(|found| !self.env.is_abstract_method(*found))
            .collect()
    }

    fn holds(&self, dep: &DependencyRecord) -> Result<bool> {
        let args = &dep.args;
        Ok(match dep.dep_type {
            DepType::EvolMethod => !self.env.is_evolved(self.method_arg(args, 0)?),
            DepType::LeafType => self.env.subclasses(self.klass_arg(args, 0)?).is_empty(),
            DepType::AbstractWithUniqueConcreteSubtype => {
                let ctx = self.klass_arg(args, 0)?;
                let unique = self.klass_arg(args, 1)?;
                self.concrete_subtypes(ctx) == [unique]
            }
            DepType::AbstractWithNoConcreteSubtype => {
                self.concrete_subtypes(self.klass_arg(args, 0)?).is_empty()
            }
            DepType::ConcreteWithNoConcreteSubtype => {
                let ctx = self.klass_arg(args, 0)?;
                self.concrete_subtypes(ctx).iter().all(|k| *k == ctx)
            }
            DepType::UniqueConcreteMethod => {
                let ctx = self.klass_arg(args, 0)?;
                let m = self.method_arg(args, 1)?;
                self.concrete_methods(ctx, m).iter().all(|found| *found == m)
            }
            DepType::AbstractWithExclusiveConcreteSubtypes2 => {
                let ctx = self.klass_arg(args, 0)?;
                let k1 = self.klass_arg(args, 1)?;
                let k2 = self.klass_arg(args, 2)?;
                self.concrete_subtypes(ctx).iter().all(|k| *k == k1 || *k == k2)
            }
            DepType::ExclusiveConcreteMethods2 => {
                let ctx = self.klass_arg(args, 0)?;
                let m1 = self.method_arg(args, 1)?;
                let m2 = self.method_arg(args, 2)?;
                self.concrete_methods(ctx, m1).iter().all(|m| *m == m1 || *m == m2)
            }
            DepType::NoFinalizableSubclasses => {
                let ctx = self.klass_arg(args, 0)?;
                !self.subtree(ctx).into_iter().any(|k| self.env.has_finalizer(k))
            }
            DepType::CallSiteTargetValue => false,
        })
    }
}

/// Check all dependencies of a version, stopping at the first violation
pub fn check_all(deps: &[DependencyRecord], metas: &[Option<MetaRef>], env: &dyn RuntimeEnv) -> Result<()> {
    for dep in deps {
        dep.check(metas, env)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ClassSpec, InMemoryVm, LoaderType};

    fn hierarchy() -> (InMemoryVm, KlassHandle, KlassHandle, KlassHandle) {
        let mut vm = InMemoryVm::new();
        let shape = vm.define_class(ClassSpec::new("app/Shape", LoaderType::App).abstract_class());
        let circle = vm.define_class(ClassSpec::new("app/Circle", LoaderType::App).extends(shape));
        let square = vm.define_class(ClassSpec::new("app/Square", LoaderType::App).extends(shape));
        (vm, shape, circle, square)
    }

    #[test]
    fn test_leaf_type() {
        let (mut vm, _, circle, _) = hierarchy();
        let metas = vec![Some(MetaRef::Klass(circle))];
        let dep = DependencyRecord::new(DepType::LeafType, vec![1]);
        assert!(dep.check(&metas, &vm).is_ok());

        vm.define_class(ClassSpec::new("app/Ring", LoaderType::App).extends(circle));
        assert!(matches!(dep.check(&metas, &vm), Err(Error::DependencyViolated(_))));
    }

    #[test]
    fn test_exclusive_subtypes() {
        let (mut vm, shape, circle, square) = hierarchy();
        let metas = vec![
            Some(MetaRef::Klass(shape)),
            Some(MetaRef::Klass(circle)),
            Some(MetaRef::Klass(square)),
        ];
        let dep = DependencyRecord::new(DepType::AbstractWithExclusiveConcreteSubtypes2, vec![1, 2, 3]);
        assert!(dep.check(&metas, &vm).is_ok());

        let unique = DependencyRecord::new(DepType::AbstractWithUniqueConcreteSubtype, vec![1, 2]);
        assert!(unique.check(&metas, &vm).is_err());

        vm.define_class(ClassSpec::new("app/Triangle", LoaderType::App).extends(shape));
        assert!(dep.check(&metas, &vm).is_err());
    }

    #[test]
    fn test_unique_concrete_method_with_implicit_context() {
        let (mut vm, shape, circle, _) = hierarchy();
        let area = vm.define_method(circle, "area", "()D");
        let metas = vec![Some(MetaRef::Method(area))];
        // Context is the holder of the method
        let dep = DependencyRecord::new(DepType::UniqueConcreteMethod, vec![0, 1]);
        assert!(dep.check(&metas, &vm).is_ok());

        let ring = vm.define_class(ClassSpec::new("app/Ring", LoaderType::App).extends(circle));
        vm.define_method(ring, "area", "()D");
        assert!(dep.check(&metas, &vm).is_err());
        let _ = shape;
    }

    #[test]
    fn test_evol_method_and_finalizer() {
        let (mut vm, shape, circle, _) = hierarchy();
        let area = vm.define_method(circle, "area", "()D");
        let metas = vec![Some(MetaRef::Method(area)), Some(MetaRef::Klass(shape))];

        let evol = DependencyRecord::new(DepType::EvolMethod, vec![1]);
        assert!(evol.check(&metas, &vm).is_ok());
        vm.set_evolved(area, true);
        assert!(evol.check(&metas, &vm).is_err());

        let fin = DependencyRecord::new(DepType::NoFinalizableSubclasses, vec![2]);
        assert!(fin.check(&metas, &vm).is_ok());
        vm.define_class(
            ClassSpec::new("app/Blob", LoaderType::App)
                .extends(shape)
                .with_finalizer(),
        );
        assert!(fin.check(&metas, &vm).is_err());
    }

    #[test]
    fn test_call_site_target_never_holds() {
        let (vm, shape, _, _) = hierarchy();
        let dep = DependencyRecord::new(DepType::CallSiteTargetValue, vec![1]);
        assert!(dep.check(&[Some(MetaRef::Klass(shape))], &vm).is_err());
    }

    #[test]
    fn test_bad_index_is_corruption() {
        let (vm, _, _, _) = hierarchy();
        let dep = DependencyRecord::new(DepType::LeafType, vec![4]);
        assert!(dep.check(&[], &vm).unwrap_err().is_corruption());
    }

    #[test]
    fn test_compare_and_remap() {
        let names = ["b", "a"];
        let key = |i: u32| names[(i - 1) as usize].to_string();
        let d1 = DependencyRecord::new(DepType::LeafType, vec![1]);
        let d2 = DependencyRecord::new(DepType::LeafType, vec![2]);
        let d3 = DependencyRecord::new(DepType::UniqueConcreteMethod, vec![0, 1]);
        assert_eq!(d1.compare_by(&d2, &key), Ordering::Greater);
        assert_eq!(d1.compare_by(&d3, &key), Ordering::Less);

        let remapped = d3.remap(&[7, 9]).unwrap();
        assert_eq!(remapped.args, vec![0, 7]);
        assert!(d2.remap(&[7]).is_err());
    }
}
