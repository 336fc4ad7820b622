//! Boundary to the managed runtime
//!
//! The cache never owns classes, methods, objects or profiles. It talks to
//! the runtime through the traits in this module:
//!
//! | Trait | Used for |
//! |-------|----------|
//! | [`ClassResolver`] | name → live class/method, content identity, init state |
//! | [`ClassHierarchy`] | re-checking dependency records |
//! | [`ProfileSource`] | scoring opt records against current counters |
//! | [`RuntimeEnv`] | all of the above plus addresses, globals and settings |
//!
//! [`InMemoryVm`] implements every trait and backs the test suite and the
//! offline tools.

mod compiled;
mod globals;
mod memory;

pub use compiled::{
    patch_slot, CodeAssembler, CompiledMethod, OopMap, RelocKind, Relocation, OPTIMIZING_LEVEL, RELOCATION_SIZE,
};
pub use globals::{VmGlobalKind, VmGlobals};
pub use memory::{ClassSpec, InMemoryVm};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value stored in an inline-cache slot that holds no receiver yet
pub const NON_OOP_WORD: u64 = 0xffff_ffff_ffff_fffe;

/// Live class handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KlassHandle(pub u32);

/// Live method handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodHandle(pub u32);

/// A live class or method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaRef {
    Klass(KlassHandle),
    Method(MethodHandle),
}

impl MetaRef {
    pub fn as_klass(self) -> Option<KlassHandle> {
        match self {
            MetaRef::Klass(k) => Some(k),
            MetaRef::Method(_) => None,
        }
    }

    pub fn as_method(self) -> Option<MethodHandle> {
        match self {
            MetaRef::Method(m) => Some(m),
            MetaRef::Klass(_) => None,
        }
    }
}

/// A heap object referenced from compiled code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    /// Interned string constant
    Str(String),
    /// `java.lang.Class` instance of a class
    Mirror(KlassHandle),
    /// Class loader object of a loader category
    Loader(LoaderType),
    /// Preallocated runtime object
    Known(KnownObject),
    /// Any other object, identified by address only
    Opaque(u64),
}

/// Loader category of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum LoaderType {
    Boot = 0,
    Ext = 1,
    App = 2,
    Custom = 4,
    /// Whatever loader defined the holder of the compiled method
    MethodHolder = 8,
}

impl LoaderType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(LoaderType::Boot),
            1 => Some(LoaderType::Ext),
            2 => Some(LoaderType::App),
            4 => Some(LoaderType::Custom),
            8 => Some(LoaderType::MethodHolder),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            LoaderType::Boot => "boot",
            LoaderType::Ext => "ext",
            LoaderType::App => "app",
            LoaderType::Custom => "custom",
            LoaderType::MethodHolder => "holder",
        }
    }
}

impl fmt::Display for LoaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Class initialization state, ordered by progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum InitState {
    Allocated = 0,
    Loaded = 1,
    Linked = 2,
    BeingInitialized = 3,
    FullyInitialized = 4,
    InitializationError = 5,
}

impl InitState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(InitState::Allocated),
            1 => Some(InitState::Loaded),
            2 => Some(InitState::Linked),
            3 => Some(InitState::BeingInitialized),
            4 => Some(InitState::FullyInitialized),
            5 => Some(InitState::InitializationError),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InitState::Allocated => "allocated",
            InitState::Loaded => "loaded",
            InitState::Linked => "linked",
            InitState::BeingInitialized => "being_initialized",
            InitState::FullyInitialized => "fully_initialized",
            InitState::InitializationError => "initialization_error",
        }
    }
}

macro_rules! known_objects {
    ($($variant:ident => $name:literal,)*) => {
        /// Preallocated objects addressed by a stable index instead of by name
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum KnownObject {
            $($variant,)*
        }

        impl KnownObject {
            pub const ALL: &'static [KnownObject] = &[$(KnownObject::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(KnownObject::$variant => $name,)*
                }
            }
        }
    };
}

known_objects! {
    ObjectMirror => "java/lang/Object mirror",
    StringMirror => "java/lang/String mirror",
    ClassMirror => "java/lang/Class mirror",
    CloneableMirror => "java/lang/Cloneable mirror",
    SerializableMirror => "java/io/Serializable mirror",
    ThrowableMirror => "java/lang/Throwable mirror",
    ErrorMirror => "java/lang/Error mirror",
    ExceptionMirror => "java/lang/Exception mirror",
    RuntimeExceptionMirror => "java/lang/RuntimeException mirror",
    NullPointerExceptionMirror => "java/lang/NullPointerException mirror",
    ArithmeticExceptionMirror => "java/lang/ArithmeticException mirror",
    ThreadMirror => "java/lang/Thread mirror",
    TheMinJintString => "the_min_jint_string",
    TheNullString => "the_null_string",
    NullPtrExceptionInstance => "null_ptr_exception_instance",
    ArithmeticExceptionInstance => "arithmetic_exception_instance",
    VirtualMachineErrorInstance => "virtual_machine_error_instance",
    VmException => "vm_exception",
    MainThreadGroup => "main_thread_group",
    SystemThreadGroup => "system_thread_group",
    TheEmptyClassKlassArray => "the_empty_class_klass_array",
    IntMirror => "int_mirror",
    FloatMirror => "float_mirror",
    DoubleMirror => "double_mirror",
    ByteMirror => "byte_mirror",
    BoolMirror => "bool_mirror",
    CharMirror => "char_mirror",
    LongMirror => "long_mirror",
    ShortMirror => "short_mirror",
    VoidMirror => "void_mirror",
    ArrayIndexOutOfBoundsException => "ArrayIndexOutOfBoundsException",
    ArrayStoreException => "ArrayStoreException",
    ClassCastException => "ClassCastException",
    AppLoader => "app_loader",
    ExtLoader => "ext_loader",
}

impl KnownObject {
    /// Stable on-disk index; 0 is reserved for "not a known object"
    pub fn index(self) -> u32 {
        self as u32 + 1
    }

    pub fn from_index(index: u32) -> Option<Self> {
        index
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i as usize).copied())
    }
}

/// Primitive type tag of a constant field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
}

/// Current constant value of a static final field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldConstant {
    pub basic_type: BasicType,
    /// Raw bits, floats and doubles by their IEEE encoding
    pub bits: i64,
}

impl FieldConstant {
    pub fn int(v: i32) -> Self {
        Self {
            basic_type: BasicType::Int,
            bits: v as i64,
        }
    }

    pub fn long(v: i64) -> Self {
        Self {
            basic_type: BasicType::Long,
            bits: v,
        }
    }

    pub fn float(v: f32) -> Self {
        Self {
            basic_type: BasicType::Float,
            bits: v.to_bits() as i32 as i64,
        }
    }

    pub fn double(v: f64) -> Self {
        Self {
            basic_type: BasicType::Double,
            bits: v.to_bits() as i64,
        }
    }

    /// Whether the value has a primitive encoding that can be compared
    pub fn is_primitive(&self) -> bool {
        self.basic_type != BasicType::Object
    }
}

/// Receiver row of a virtual call profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverRow {
    pub klass: KlassHandle,
    pub count: i64,
}

/// Call-site profile as seen by the compiler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallProfile {
    /// Total invocations; negative when type checks failed
    pub count: i64,
    pub receivers: Vec<ReceiverRow>,
}

impl CallProfile {
    pub fn morphism(&self) -> usize {
        self.receivers.len()
    }
}

/// Raw profile cell at one bytecode index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileData {
    /// Direct call counter
    Counter { count: i64 },
    /// Virtual call with receiver rows
    VirtualCall { count: i64, receivers: Vec<ReceiverRow> },
    /// Conditional branch
    Branch { taken: i64, not_taken: i64 },
}

/// Pointer-compression mode; only the shape matters to generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NarrowPtr {
    pub base: u64,
    pub shift: u32,
    pub implicit_null_checks: bool,
}

/// A boolean runtime flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmFlag {
    pub name: String,
    pub value: bool,
    /// Product flags only; diagnostic/experimental/develop flags are ignored
    pub product: bool,
}

impl VmFlag {
    pub fn product(name: impl Into<String>, value: bool) -> Self {
        Self {
            name: name.into(),
            value,
            product: true,
        }
    }
}

/// Runtime settings that influence generated code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSettings {
    pub object_alignment: u32,
    pub contended_padding_width: u32,
    pub fields_allocation_style: u32,
    pub narrow_oop: NarrowPtr,
    pub narrow_klass: NarrowPtr,
    pub flags: Vec<VmFlag>,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            object_alignment: 8,
            contended_padding_width: 128,
            fields_allocation_style: 1,
            narrow_oop: NarrowPtr {
                base: 0,
                shift: 3,
                implicit_null_checks: true,
            },
            narrow_klass: NarrowPtr {
                base: 0,
                shift: 3,
                implicit_null_checks: true,
            },
            flags: Vec::new(),
        }
    }
}

/// Name and identity lookups for classes and methods
pub trait ClassResolver {
    /// Find an already loaded class by name in a loader category
    fn find_class(&self, name: &str, loader: LoaderType) -> Option<KlassHandle>;
    /// Find a method declared in `holder` or inherited by it
    fn find_method(&self, holder: KlassHandle, name: &str, signature: &str) -> Option<MethodHandle>;

    fn class_name(&self, klass: KlassHandle) -> String;
    fn class_identity(&self, klass: KlassHandle) -> u64;
    fn class_loader(&self, klass: KlassHandle) -> LoaderType;
    fn init_state(&self, klass: KlassHandle) -> InitState;
    /// False for array classes
    fn is_instance_class(&self, klass: KlassHandle) -> bool;
    fn is_interface(&self, klass: KlassHandle) -> bool;
    /// Interface without fields and default methods
    fn is_pure_interface(&self, klass: KlassHandle) -> bool;
    fn is_anonymous(&self, klass: KlassHandle) -> bool;

    fn method_holder(&self, method: MethodHandle) -> KlassHandle;
    fn method_name(&self, method: MethodHandle) -> String;
    fn method_signature(&self, method: MethodHandle) -> String;
    fn method_identity(&self, method: MethodHandle) -> u64;

    /// `holder.name(sig)` display name of a method
    fn method_display_name(&self, method: MethodHandle) -> String {
        format!(
            "{}.{}{}",
            self.class_name(self.method_holder(method)),
            self.method_name(method),
            self.method_signature(method)
        )
    }

    fn meta_name(&self, meta: MetaRef) -> String {
        match meta {
            MetaRef::Klass(k) => self.class_name(k),
            MetaRef::Method(m) => self.method_display_name(m),
        }
    }

    fn meta_identity(&self, meta: MetaRef) -> u64 {
        match meta {
            MetaRef::Klass(k) => self.class_identity(k),
            MetaRef::Method(m) => self.method_identity(m),
        }
    }

    /// Loader category of a class, or of a method's holder
    fn meta_loader(&self, meta: MetaRef) -> LoaderType {
        match meta {
            MetaRef::Klass(k) => self.class_loader(k),
            MetaRef::Method(m) => self.class_loader(self.method_holder(m)),
        }
    }
}

/// Class hierarchy queries used to re-check dependencies
pub trait ClassHierarchy {
    fn super_class(&self, klass: KlassHandle) -> Option<KlassHandle>;
    /// Direct subclasses and direct implementors
    fn subclasses(&self, klass: KlassHandle) -> Vec<KlassHandle>;
    fn is_abstract(&self, klass: KlassHandle) -> bool;
    fn has_finalizer(&self, klass: KlassHandle) -> bool;
    /// Method declared directly in `klass`
    fn declared_method(&self, klass: KlassHandle, name: &str, signature: &str) -> Option<MethodHandle>;
    fn is_abstract_method(&self, method: MethodHandle) -> bool;
    /// Whether the method was replaced by a class redefinition
    fn is_evolved(&self, method: MethodHandle) -> bool;
}

/// Interpreter profile queries used to score opt records
pub trait ProfileSource {
    fn call_profile(&self, method: MethodHandle, bci: i32) -> CallProfile;
    fn has_method_data(&self, method: MethodHandle) -> bool;
    fn is_mature(&self, method: MethodHandle) -> bool;
    fn profile_at(&self, method: MethodHandle, bci: i32) -> Option<ProfileData>;
    fn constant_field(&self, klass: KlassHandle, field_offset: u32) -> Option<FieldConstant>;
}

/// Everything the cache needs from the running process
pub trait RuntimeEnv: ClassResolver + ClassHierarchy + ProfileSource + Sync {
    fn globals(&self) -> &VmGlobals;
    fn settings(&self) -> VmSettings;
    /// Identity of the runtime build; cache files from other builds are refused
    fn build_identity(&self) -> String;
    /// Index of `obj` among the preallocated objects, if it is one
    fn known_object(&self, obj: &ObjectRef) -> Option<KnownObject>;
    fn object_address(&self, obj: &ObjectRef) -> u64;
    fn metadata_address(&self, meta: MetaRef) -> u64;
    /// Address at which compiled code of `method` is installed
    fn install_address(&self, method: MethodHandle) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_object_index_round_trip() {
        assert_eq!(KnownObject::from_index(0), None);
        for obj in KnownObject::ALL {
            assert_eq!(KnownObject::from_index(obj.index()), Some(*obj));
        }
        assert_eq!(KnownObject::from_index(KnownObject::ALL.len() as u32 + 1), None);
    }

    #[test]
    fn test_loader_and_state_codes() {
        assert_eq!(LoaderType::from_u16(8), Some(LoaderType::MethodHolder));
        assert_eq!(LoaderType::from_u16(3), None);
        assert_eq!(InitState::from_u32(4), Some(InitState::FullyInitialized));
        assert!(InitState::Linked < InitState::FullyInitialized);
    }

    #[test]
    fn test_field_constant_encodings() {
        assert_eq!(FieldConstant::float(1.0).bits, 0x3f80_0000);
        assert_eq!(FieldConstant::int(-1).bits, -1);
        assert!(FieldConstant::long(3).is_primitive());
    }
}
