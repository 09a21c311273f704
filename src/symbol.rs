//! Symbol data model.
//!
//! Defines the entries stored in the global symbol table and the reference
//! records attached to them. One `SymbolEntry` exists per distinct name ever
//! observed; each entry owns the list of sites that refer to it.

/// Visibility/strength classification of a symbol as it appears in an
/// object file's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    Undefined,
    Local,
    Global,
    Weak,
    Common,
}

/// Resolution state of a symbol table entry.
///
/// At most one `Defined` (strong) definition may exist per name; a second
/// strong definition is a conflict, never an overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    Undefined,
    Defined,
    Weak,
    Common,
}

impl std::fmt::Display for SymbolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SymbolStatus::Undefined => "UNDEFINED",
            SymbolStatus::Defined => "DEFINED",
            SymbolStatus::Weak => "WEAK",
            SymbolStatus::Common => "COMMON",
        };
        f.write_str(s)
    }
}

/// What the symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Variable,
    Unknown,
}

/// How a reference site must be patched once the target address is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Full target address written at the site (S + A, 64-bit).
    Absolute,
    /// PC-relative displacement (S + A - P, 32-bit).
    Relative,
    /// Procedure linkage stub reference; patched like `Relative`.
    Plt,
    /// Global offset table reference; patched like `Relative`.
    Got,
}

/// One usage site of a symbol: a relocation to be patched later.
///
/// A reference may be registered before any definition of the symbol
/// exists; forward references are legal.
#[derive(Debug, Clone)]
pub struct SymbolReference {
    pub referencing_file: String,
    pub section_name: String,
    pub offset: u64,
    pub kind: RefKind,
    pub addend: i64,
    /// True once this specific use has been bound to the owning entry's
    /// address by a relocation pass.
    pub resolved: bool,
}

/// A symbol in the global symbol table.
///
/// `address` and `size` are meaningless until the entry leaves the
/// `Undefined` state. `resolved` flips to true once a concrete address is
/// known; `Common` entries stay unresolved until placement, which is the
/// executable generator's concern.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub status: SymbolStatus,
    pub kind: SymbolKind,
    /// File providing the last accepted definition.
    pub defining_file: Option<String>,
    /// Section holding the last accepted definition.
    pub section_name: Option<String>,
    pub resolved: bool,
    pub references: Vec<SymbolReference>,
}

impl SymbolEntry {
    /// A placeholder entry for a name only ever seen in references.
    pub fn undefined(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: 0,
            size: 0,
            status: SymbolStatus::Undefined,
            kind: SymbolKind::Unknown,
            defining_file: None,
            section_name: None,
            resolved: false,
            references: Vec::new(),
        }
    }

    /// Install a definition's payload, replacing whatever was stored.
    pub fn define(
        &mut self,
        address: u64,
        size: u64,
        status: SymbolStatus,
        kind: SymbolKind,
        defining_file: &str,
        section_name: Option<&str>,
    ) {
        self.address = address;
        self.size = size;
        self.status = status;
        if kind != SymbolKind::Unknown || self.kind == SymbolKind::Unknown {
            self.kind = kind;
        }
        self.defining_file = Some(defining_file.to_string());
        self.section_name = section_name.map(str::to_string);
        // Common entries have no address until the generator places them.
        self.resolved = matches!(status, SymbolStatus::Defined | SymbolStatus::Weak);
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }
}
