//! Typed queries over the parsed configuration tree.
//!
//! The parser (a separate component) hands us a flat buffer of entries.
//! Values in the same scope are chained through relative `next_in_scope`
//! offsets (0 means last); objects and loadable-entry markers point at their
//! first child. Queries walk those chains.
//!
//! Missing mandatory keys, duplicate keys that must be unique, and values of
//! an unexpected type all abort the load with a message naming the key.

use core::fmt;
use core::ops::BitOr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Value<'a> {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Str(&'a str),
    Object(Scope),
}

impl Value<'_> {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Unsigned(_) => ValueKind::Unsigned,
            Value::Signed(_) => ValueKind::Signed,
            Value::Str(_) => ValueKind::Str,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean,
    Unsigned,
    Signed,
    Str,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "Null",
            ValueKind::Boolean => "Boolean",
            ValueKind::Unsigned => "Unsigned Integer",
            ValueKind::Signed => "Signed Integer",
            ValueKind::Str => "String",
            ValueKind::Object => "Object",
        };
        f.write_str(name)
    }
}

/// OR-able set of [`ValueKind`]s a query accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TypeMask(u8);

impl TypeMask {
    pub const NULL: TypeMask = TypeMask(1 << 0);
    pub const BOOLEAN: TypeMask = TypeMask(1 << 1);
    pub const UNSIGNED: TypeMask = TypeMask(1 << 2);
    pub const SIGNED: TypeMask = TypeMask(1 << 3);
    pub const STRING: TypeMask = TypeMask(1 << 4);
    pub const OBJECT: TypeMask = TypeMask(1 << 5);
    pub const ANY: TypeMask = TypeMask(0x3F);

    pub fn contains(self, kind: ValueKind) -> bool {
        let bit = match kind {
            ValueKind::Null => Self::NULL,
            ValueKind::Boolean => Self::BOOLEAN,
            ValueKind::Unsigned => Self::UNSIGNED,
            ValueKind::Signed => Self::SIGNED,
            ValueKind::Str => Self::STRING,
            ValueKind::Object => Self::OBJECT,
        };
        self.0 & bit.0 != 0
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

impl fmt::Display for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all = [
            (Self::NULL, ValueKind::Null),
            (Self::BOOLEAN, ValueKind::Boolean),
            (Self::UNSIGNED, ValueKind::Unsigned),
            (Self::SIGNED, ValueKind::Signed),
            (Self::STRING, ValueKind::Str),
            (Self::OBJECT, ValueKind::Object),
        ];

        let mut first = true;
        for (bit, kind) in all {
            if self.0 & bit.0 == 0 {
                continue;
            }

            if !first {
                f.write_str(" or ")?;
            }
            write!(f, "{kind}")?;
            first = false;
        }

        Ok(())
    }
}

/// First entry of a scope, or empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Scope(pub Option<u32>);

impl Scope {
    pub const fn empty() -> Scope {
        Scope(None)
    }
}

/// One slot of the parser's flat output buffer.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    pub key: &'a str,
    pub kind: EntryKind<'a>,
    /// Relative offset to the next entry in the same scope; 0 means last.
    pub next_in_scope: u32,
}

#[derive(Clone, Copy)]
pub enum EntryKind<'a> {
    Value(Value<'a>),
    Loadable {
        first_child: Option<u32>,
        next_loadable: Option<u32>,
    },
}

/// A named block describing one bootable target.
#[derive(Clone, Copy)]
pub struct LoadableEntry<'a> {
    pub name: &'a str,
    pub scope: Scope,
}

/// A value found by a query. Keeps its position so repeated keys can be
/// walked with [`Config::next_matching`].
#[derive(Clone, Copy)]
pub struct ValueRef<'a> {
    pub key: &'a str,
    pub value: Value<'a>,
    index: u32,
}

pub struct Config<'a> {
    entries: &'a [Entry<'a>],
    root: Scope,
    first_loadable: Option<u32>,
}

impl<'a> Config<'a> {
    pub fn new(entries: &'a [Entry<'a>], root: Scope, first_loadable: Option<u32>) -> Self {
        Config {
            entries,
            root,
            first_loadable,
        }
    }

    pub fn root_scope(&self) -> Scope {
        self.root
    }

    pub fn first_loadable_entry(&self) -> Option<LoadableEntry<'a>> {
        self.first_loadable.map(|index| self.loadable_at(index))
    }

    pub fn loadable_entry(&self, name: &str) -> Option<LoadableEntry<'a>> {
        let mut index = self.first_loadable;

        while let Some(i) = index {
            let entry = &self.entries[i as usize];
            let EntryKind::Loadable { next_loadable, .. } = entry.kind else {
                panic!("config entry {i} is not a loadable entry");
            };

            if entry.key == name {
                return Some(self.loadable_at(i));
            }

            index = next_loadable;
        }

        None
    }

    fn loadable_at(&self, index: u32) -> LoadableEntry<'a> {
        let entry = &self.entries[index as usize];
        let EntryKind::Loadable { first_child, .. } = entry.kind else {
            panic!("config entry {index} is not a loadable entry");
        };

        LoadableEntry {
            name: entry.key,
            scope: Scope(first_child),
        }
    }

    fn next_index(&self, index: u32) -> Option<u32> {
        let offset = self.entries[index as usize].next_in_scope;
        (offset != 0).then(|| index + offset)
    }

    fn find(
        &self,
        scope: Scope,
        key: &str,
        mask: TypeMask,
        must_be_unique: bool,
    ) -> Option<ValueRef<'a>> {
        let mut index = scope.0;
        let mut found: Option<ValueRef<'a>> = None;

        while let Some(i) = index {
            let entry = &self.entries[i as usize];
            index = self.next_index(i);

            let EntryKind::Value(value) = entry.kind else {
                continue;
            };

            if entry.key != key {
                continue;
            }

            if found.is_some() {
                if must_be_unique {
                    panic!("expected key \"{key}\" to be unique");
                }
                break;
            }

            found = Some(ValueRef {
                key: entry.key,
                value,
                index: i,
            });

            if !must_be_unique {
                break;
            }
        }

        let found = found?;
        if !mask.contains(found.value.kind()) {
            panic!(
                "unexpected type for \"{key}\"! expected: {mask}, got: {}",
                found.value.kind()
            );
        }

        Some(found)
    }

    /// Looks `key` up in `scope`; a second occurrence is a configuration
    /// error.
    pub fn get(&self, scope: Scope, key: &str, mask: TypeMask) -> Option<ValueRef<'a>> {
        self.find(scope, key, mask, true)
    }

    /// Looks the first occurrence of `key` up in `scope`; repeats are
    /// allowed and reachable through [`Config::next_matching`].
    pub fn get_first(&self, scope: Scope, key: &str, mask: TypeMask) -> Option<ValueRef<'a>> {
        self.find(scope, key, mask, false)
    }

    pub fn get_mandatory(&self, scope: Scope, key: &str, mask: TypeMask) -> ValueRef<'a> {
        match self.get(scope, key, mask) {
            Some(value) => value,
            None => panic!("couldn't find mandatory key \"{key}\" in the config file"),
        }
    }

    pub fn get_bool(&self, scope: Scope, key: &str) -> Option<bool> {
        self.get(scope, key, TypeMask::BOOLEAN).map(|v| match v.value {
            Value::Boolean(b) => b,
            _ => unreachable!(),
        })
    }

    pub fn get_unsigned(&self, scope: Scope, key: &str) -> Option<u64> {
        self.get(scope, key, TypeMask::UNSIGNED).map(|v| match v.value {
            Value::Unsigned(u) => u,
            _ => unreachable!(),
        })
    }

    pub fn get_string(&self, scope: Scope, key: &str) -> Option<&'a str> {
        self.get(scope, key, TypeMask::STRING).map(|v| match v.value {
            Value::Str(s) => s,
            _ => unreachable!(),
        })
    }

    pub fn mandatory_string(&self, scope: Scope, key: &str) -> &'a str {
        match self.get_mandatory(scope, key, TypeMask::STRING).value {
            Value::Str(s) => s,
            _ => unreachable!(),
        }
    }

    /// Next occurrence of `current`'s key within the same scope. A repeat
    /// whose type falls outside `mask` is a configuration error.
    pub fn next_matching(&self, current: &ValueRef<'a>, mask: TypeMask) -> Option<ValueRef<'a>> {
        let mut index = self.next_index(current.index);

        while let Some(i) = index {
            let entry = &self.entries[i as usize];
            index = self.next_index(i);

            let EntryKind::Value(value) = entry.kind else {
                continue;
            };

            if entry.key != current.key {
                continue;
            }

            if !mask.contains(value.kind()) {
                panic!(
                    "unexpected type for \"{}\"! expected: {mask}, got: {}",
                    entry.key,
                    value.kind()
                );
            }

            return Some(ValueRef {
                key: entry.key,
                value,
                index: i,
            });
        }

        None
    }
}
