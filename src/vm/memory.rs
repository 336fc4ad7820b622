//! In-memory runtime used by tests, benchmarks and the offline tools

use super::{
    CallProfile, ClassHierarchy, ClassResolver, FieldConstant, InitState, KlassHandle, KnownObject,
    LoaderType, MetaRef, MethodHandle, ObjectRef, ProfileData, ProfileSource, RuntimeEnv, VmGlobalKind,
    VmGlobals, VmSettings,
};
use crate::format::stable_hash32;
use rustc_hash::FxHashMap as HashMap;

const STRING_BASE: u64 = 0x1_0000_0000;
const MIRROR_BASE: u64 = 0x2_0000_0000;
const LOADER_BASE: u64 = 0x3_0000_0000;
const KNOWN_BASE: u64 = 0x4_0000_0000;
const KLASS_META_BASE: u64 = 0x5_0000_0000;
const METHOD_META_BASE: u64 = 0x6_0000_0000;
const GLOBALS_BASE: u64 = 0x10_0000_0000;
const GLOBAL_STRIDE: u64 = 0x100;
const CODE_BASE: u64 = 0x7f00_0000_0000;
const CODE_STRIDE: u64 = 0x1_0000;

/// Builder for a class definition
#[derive(Debug, Clone)]
pub struct ClassSpec {
    name: String,
    loader: LoaderType,
    identity: Option<u64>,
    super_class: Option<KlassHandle>,
    interfaces: Vec<KlassHandle>,
    init_state: InitState,
    is_interface: bool,
    is_pure_interface: bool,
    is_abstract: bool,
    is_array: bool,
    is_anonymous: bool,
    has_finalizer: bool,
}

impl ClassSpec {
    pub fn new(name: impl Into<String>, loader: LoaderType) -> Self {
        Self {
            name: name.into(),
            loader,
            identity: None,
            super_class: None,
            interfaces: Vec::new(),
            init_state: InitState::FullyInitialized,
            is_interface: false,
            is_pure_interface: false,
            is_abstract: false,
            is_array: false,
            is_anonymous: false,
            has_finalizer: false,
        }
    }

    pub fn identity(mut self, identity: u64) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn extends(mut self, super_class: KlassHandle) -> Self {
        self.super_class = Some(super_class);
        self
    }

    pub fn implements(mut self, interface: KlassHandle) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn init_state(mut self, state: InitState) -> Self {
        self.init_state = state;
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self.is_abstract = true;
        self
    }

    /// Interface without fields or default methods
    pub fn pure_interface(mut self) -> Self {
        self.is_pure_interface = true;
        self.interface()
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.is_anonymous = true;
        self
    }

    pub fn with_finalizer(mut self) -> Self {
        self.has_finalizer = true;
        self
    }
}

#[derive(Debug, Clone)]
struct ClassInfo {
    spec: ClassSpec,
    identity: u64,
    subclasses: Vec<KlassHandle>,
    unloaded: bool,
}

#[derive(Debug, Clone)]
struct MethodInfo {
    holder: KlassHandle,
    name: String,
    signature: String,
    own_identity: u64,
    is_abstract: bool,
    evolved: bool,
}

/// A self-contained class world with deterministic addresses.
///
/// Two instances built the same way agree on names and identities. Giving
/// one of them an address shift makes it behave like a second process:
/// every object, metadata, global and code address moves.
#[derive(Debug, Clone)]
pub struct InMemoryVm {
    classes: Vec<ClassInfo>,
    methods: Vec<MethodInfo>,
    call_profiles: HashMap<(MethodHandle, i32), CallProfile>,
    profile_data: HashMap<(MethodHandle, i32), ProfileData>,
    mature: HashMap<MethodHandle, bool>,
    constants: HashMap<(KlassHandle, u32), FieldConstant>,
    known: HashMap<ObjectRef, KnownObject>,
    globals: VmGlobals,
    settings: VmSettings,
    build_identity: String,
    address_shift: u64,
}

impl Default for InMemoryVm {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVm {
    pub fn new() -> Self {
        Self::with_address_shift(0)
    }

    /// Runtime whose addresses are all displaced by `shift`
    pub fn with_address_shift(shift: u64) -> Self {
        let mut globals = VmGlobals::new();
        for (i, kind) in VmGlobalKind::ALL.iter().enumerate() {
            globals.register_range(*kind, GLOBALS_BASE + shift + i as u64 * GLOBAL_STRIDE, GLOBAL_STRIDE);
        }
        Self {
            classes: Vec::new(),
            methods: Vec::new(),
            call_profiles: HashMap::default(),
            profile_data: HashMap::default(),
            mature: HashMap::default(),
            constants: HashMap::default(),
            known: HashMap::default(),
            globals,
            settings: VmSettings::default(),
            build_identity: format!("code-revive-test-vm {}", crate::VERSION),
            address_shift: shift,
        }
    }

    pub fn define_class(&mut self, spec: ClassSpec) -> KlassHandle {
        let handle = KlassHandle(self.classes.len() as u32);
        let identity = spec
            .identity
            .unwrap_or_else(|| name_identity(&spec.name));
        for parent in spec.super_class.iter().chain(spec.interfaces.iter()) {
            if let Some(info) = self.classes.get_mut(parent.0 as usize) {
                info.subclasses.push(handle);
            }
        }
        self.classes.push(ClassInfo {
            spec,
            identity,
            subclasses: Vec::new(),
            unloaded: false,
        });
        handle
    }

    pub fn define_method(&mut self, holder: KlassHandle, name: &str, signature: &str) -> MethodHandle {
        self.push_method(holder, name, signature, false)
    }

    pub fn define_abstract_method(&mut self, holder: KlassHandle, name: &str, signature: &str) -> MethodHandle {
        self.push_method(holder, name, signature, true)
    }

    fn push_method(&mut self, holder: KlassHandle, name: &str, signature: &str, is_abstract: bool) -> MethodHandle {
        let handle = MethodHandle(self.methods.len() as u32);
        self.methods.push(MethodInfo {
            holder,
            name: name.to_string(),
            signature: signature.to_string(),
            own_identity: name_identity(&format!("{}{}", name, signature)),
            is_abstract,
            evolved: false,
        });
        handle
    }

    pub fn set_init_state(&mut self, klass: KlassHandle, state: InitState) {
        if let Some(info) = self.classes.get_mut(klass.0 as usize) {
            info.spec.init_state = state;
        }
    }

    /// Replace the class bytes; identities change and old methods are evolved
    pub fn redefine_class(&mut self, klass: KlassHandle, new_identity: u64) {
        if let Some(info) = self.classes.get_mut(klass.0 as usize) {
            info.identity = new_identity;
        }
        for m in self.methods.iter_mut().filter(|m| m.holder == klass) {
            m.evolved = true;
        }
    }

    /// Make the class invisible to name lookup
    pub fn unload_class(&mut self, klass: KlassHandle) {
        if let Some(info) = self.classes.get_mut(klass.0 as usize) {
            info.unloaded = true;
        }
    }

    pub fn set_evolved(&mut self, method: MethodHandle, evolved: bool) {
        if let Some(m) = self.methods.get_mut(method.0 as usize) {
            m.evolved = evolved;
        }
    }

    pub fn set_call_profile(&mut self, method: MethodHandle, bci: i32, profile: CallProfile) {
        self.call_profiles.insert((method, bci), profile);
    }

    pub fn set_profile_data(&mut self, method: MethodHandle, bci: i32, data: ProfileData) {
        self.profile_data.insert((method, bci), data);
    }

    pub fn set_mature(&mut self, method: MethodHandle, mature: bool) {
        self.mature.insert(method, mature);
    }

    pub fn set_constant(&mut self, klass: KlassHandle, field_offset: u32, value: FieldConstant) {
        self.constants.insert((klass, field_offset), value);
    }

    /// Treat `obj` as the preallocated object `known`
    pub fn register_known(&mut self, obj: ObjectRef, known: KnownObject) {
        self.known.insert(obj, known);
    }

    pub fn globals_mut(&mut self) -> &mut VmGlobals {
        &mut self.globals
    }

    pub fn settings_mut(&mut self) -> &mut VmSettings {
        &mut self.settings
    }

    pub fn set_build_identity(&mut self, identity: impl Into<String>) {
        self.build_identity = identity.into();
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    fn class(&self, klass: KlassHandle) -> Option<&ClassInfo> {
        self.classes.get(klass.0 as usize)
    }

    fn method(&self, method: MethodHandle) -> Option<&MethodInfo> {
        self.methods.get(method.0 as usize)
    }

    fn loaders_visible_from(loader: LoaderType) -> &'static [LoaderType] {
        match loader {
            LoaderType::Boot => &[LoaderType::Boot],
            LoaderType::Ext => &[LoaderType::Ext, LoaderType::Boot],
            LoaderType::App => &[LoaderType::App, LoaderType::Ext, LoaderType::Boot],
            LoaderType::Custom => &[LoaderType::Custom],
            LoaderType::MethodHolder => &[],
        }
    }
}

fn name_identity(name: &str) -> u64 {
    let lo = stable_hash32(0, name.as_bytes()) as u64;
    let hi = stable_hash32(0x9e37_79b9, name.as_bytes()) as u64;
    (hi << 32) | lo
}

impl ClassResolver for InMemoryVm {
    fn find_class(&self, name: &str, loader: LoaderType) -> Option<KlassHandle> {
        for candidate in Self::loaders_visible_from(loader) {
            let found = self
                .classes
                .iter()
                .position(|c| !c.unloaded && c.spec.loader == *candidate && c.spec.name == name);
            if let Some(i) = found {
                return Some(KlassHandle(i as u32));
            }
        }
        None
    }

    fn find_method(&self, holder: KlassHandle, name: &str, signature: &str) -> Option<MethodHandle> {
        let mut current = Some(holder);
        while let Some(k) = current {
            if let Some(m) = self.declared_method(k, name, signature) {
                return Some(m);
            }
            current = self.super_class(k);
        }
        None
    }

    fn class_name(&self, klass: KlassHandle) -> String {
        self.class(klass)
            .map(|c| c.spec.name.clone())
            .unwrap_or_else(|| format!("<unknown class {}>", klass.0))
    }

    fn class_identity(&self, klass: KlassHandle) -> u64 {
        self.class(klass).map(|c| c.identity).unwrap_or(0)
    }

    fn class_loader(&self, klass: KlassHandle) -> LoaderType {
        self.class(klass).map(|c| c.spec.loader).unwrap_or(LoaderType::Custom)
    }

    fn init_state(&self, klass: KlassHandle) -> InitState {
        self.class(klass)
            .map(|c| c.spec.init_state)
            .unwrap_or(InitState::Allocated)
    }

    fn is_instance_class(&self, klass: KlassHandle) -> bool {
        self.class(klass).map(|c| !c.spec.is_array).unwrap_or(false)
    }

    fn is_interface(&self, klass: KlassHandle) -> bool {
        self.class(klass).map(|c| c.spec.is_interface).unwrap_or(false)
    }

    fn is_pure_interface(&self, klass: KlassHandle) -> bool {
        self.class(klass).map(|c| c.spec.is_pure_interface).unwrap_or(false)
    }

    fn is_anonymous(&self, klass: KlassHandle) -> bool {
        self.class(klass).map(|c| c.spec.is_anonymous).unwrap_or(false)
    }

    fn method_holder(&self, method: MethodHandle) -> KlassHandle {
        self.method(method).map(|m| m.holder).unwrap_or(KlassHandle(u32::MAX))
    }

    fn method_name(&self, method: MethodHandle) -> String {
        self.method(method).map(|m| m.name.clone()).unwrap_or_default()
    }

    fn method_signature(&self, method: MethodHandle) -> String {
        self.method(method).map(|m| m.signature.clone()).unwrap_or_default()
    }

    fn method_identity(&self, method: MethodHandle) -> u64 {
        self.method(method)
            .map(|m| self.class_identity(m.holder).rotate_left(17) ^ m.own_identity)
            .unwrap_or(0)
    }
}

impl ClassHierarchy for InMemoryVm {
    fn super_class(&self, klass: KlassHandle) -> Option<KlassHandle> {
        self.class(klass).and_then(|c| c.spec.super_class)
    }

    fn subclasses(&self, klass: KlassHandle) -> Vec<KlassHandle> {
        self.class(klass)
            .map(|c| {
                c.subclasses
                    .iter()
                    .copied()
                    .filter(|k| self.class(*k).is_some_and(|s| !s.unloaded))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_abstract(&self, klass: KlassHandle) -> bool {
        self.class(klass).map(|c| c.spec.is_abstract).unwrap_or(false)
    }

    fn has_finalizer(&self, klass: KlassHandle) -> bool {
        self.class(klass).map(|c| c.spec.has_finalizer).unwrap_or(false)
    }

    fn declared_method(&self, klass: KlassHandle, name: &str, signature: &str) -> Option<MethodHandle> {
        self.methods
            .iter()
            .position(|m| m.holder == klass && m.name == name && m.signature == signature)
            .map(|i| MethodHandle(i as u32))
    }

    fn is_abstract_method(&self, method: MethodHandle) -> bool {
        self.method(method).map(|m| m.is_abstract).unwrap_or(false)
    }

    fn is_evolved(&self, method: MethodHandle) -> bool {
        self.method(method).map(|m| m.evolved).unwrap_or(true)
    }
}

impl ProfileSource for InMemoryVm {
    fn call_profile(&self, method: MethodHandle, bci: i32) -> CallProfile {
        if let Some(p) = self.call_profiles.get(&(method, bci)) {
            return p.clone();
        }
        match self.profile_data.get(&(method, bci)) {
            Some(ProfileData::VirtualCall { count, receivers }) => CallProfile {
                count: *count,
                receivers: receivers.clone(),
            },
            Some(ProfileData::Counter { count }) => CallProfile {
                count: *count,
                receivers: Vec::new(),
            },
            _ => CallProfile::default(),
        }
    }

    fn has_method_data(&self, method: MethodHandle) -> bool {
        self.profile_data.keys().any(|(m, _)| *m == method)
            || self.call_profiles.keys().any(|(m, _)| *m == method)
    }

    fn is_mature(&self, method: MethodHandle) -> bool {
        self.mature.get(&method).copied().unwrap_or(false)
    }

    fn profile_at(&self, method: MethodHandle, bci: i32) -> Option<ProfileData> {
        self.profile_data.get(&(method, bci)).cloned()
    }

    fn constant_field(&self, klass: KlassHandle, field_offset: u32) -> Option<FieldConstant> {
        self.constants.get(&(klass, field_offset)).copied()
    }
}

impl RuntimeEnv for InMemoryVm {
    fn globals(&self) -> &VmGlobals {
        &self.globals
    }

    fn settings(&self) -> VmSettings {
        self.settings.clone()
    }

    fn build_identity(&self) -> String {
        self.build_identity.clone()
    }

    fn known_object(&self, obj: &ObjectRef) -> Option<KnownObject> {
        match obj {
            ObjectRef::Known(k) => Some(*k),
            other => self.known.get(other).copied(),
        }
    }

    fn object_address(&self, obj: &ObjectRef) -> u64 {
        let shift = self.address_shift;
        match obj {
            ObjectRef::Str(s) => STRING_BASE + shift + stable_hash32(0, s.as_bytes()) as u64 * 8,
            ObjectRef::Mirror(k) => MIRROR_BASE + shift + k.0 as u64 * 16,
            ObjectRef::Loader(l) => LOADER_BASE + shift + l.as_u16() as u64 * 16,
            ObjectRef::Known(k) => KNOWN_BASE + shift + k.index() as u64 * 16,
            ObjectRef::Opaque(addr) => *addr,
        }
    }

    fn metadata_address(&self, meta: MetaRef) -> u64 {
        let shift = self.address_shift;
        match meta {
            MetaRef::Klass(k) => KLASS_META_BASE + shift + k.0 as u64 * 64,
            MetaRef::Method(m) => METHOD_META_BASE + shift + m.0 as u64 * 64,
        }
    }

    fn install_address(&self, method: MethodHandle) -> u64 {
        CODE_BASE + self.address_shift + method.0 as u64 * CODE_STRIDE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_through_parent_loaders() {
        let mut vm = InMemoryVm::new();
        let string = vm.define_class(ClassSpec::new("java/lang/String", LoaderType::Boot));
        let app = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        assert_eq!(vm.find_class("java/lang/String", LoaderType::App), Some(string));
        assert_eq!(vm.find_class("app/Main", LoaderType::Boot), None);
        assert_eq!(vm.find_class("app/Main", LoaderType::App), Some(app));

        vm.unload_class(app);
        assert_eq!(vm.find_class("app/Main", LoaderType::App), None);
    }

    #[test]
    fn test_inherited_method_lookup() {
        let mut vm = InMemoryVm::new();
        let base = vm.define_class(ClassSpec::new("app/Base", LoaderType::App));
        let derived = vm.define_class(ClassSpec::new("app/Derived", LoaderType::App).extends(base));
        let m = vm.define_method(base, "size", "()I");
        assert_eq!(vm.find_method(derived, "size", "()I"), Some(m));
        assert_eq!(vm.declared_method(derived, "size", "()I"), None);
        assert_eq!(vm.method_display_name(m), "app/Base.size()I");
    }

    #[test]
    fn test_identities_are_stable_across_instances() {
        let build = |shift| {
            let mut vm = InMemoryVm::with_address_shift(shift);
            let k = vm.define_class(ClassSpec::new("app/A", LoaderType::App));
            let m = vm.define_method(k, "f", "()V");
            (vm, k, m)
        };
        let (a, ka, ma) = build(0);
        let (b, kb, mb) = build(0x1000);
        assert_eq!(a.class_identity(ka), b.class_identity(kb));
        assert_eq!(a.method_identity(ma), b.method_identity(mb));
        assert_ne!(a.install_address(ma), b.install_address(mb));
        assert_ne!(
            a.globals().address_of(VmGlobalKind::Dsin, 0).unwrap(),
            b.globals().address_of(VmGlobalKind::Dsin, 0).unwrap()
        );
    }

    #[test]
    fn test_redefinition_changes_method_identity() {
        let mut vm = InMemoryVm::new();
        let k = vm.define_class(ClassSpec::new("app/A", LoaderType::App));
        let m = vm.define_method(k, "f", "()V");
        let before = vm.method_identity(m);
        vm.redefine_class(k, 42);
        assert_ne!(vm.method_identity(m), before);
        assert!(vm.is_evolved(m));
    }
}
