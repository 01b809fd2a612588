use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The type of a rule value. Containers carry their element type
/// recursively; nested objects carry their own rule list.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemType {
    String,
    Integer,
    Number,
    Boolean,
    /// Arbitrary data stored through its string form.
    Stringifiable,
    /// Id-hash reference to a versioned object of one of the named types.
    /// An empty list admits any type.
    ReferenceToId(Vec<String>),
    /// Content-hash reference to an object of one of the named types.
    ReferenceToObj(Vec<String>),
    ReferenceToClob,
    ReferenceToBlob,
    Array(Box<ItemType>),
    Bag(Box<ItemType>),
    Set(Box<ItemType>),
    /// String-keyed map with a value subtype.
    Map(Box<ItemType>),
    Object(Vec<Rule>),
}

impl ItemType {
    /// The element type a path descends into when entering this container,
    /// if the container is enterable.
    pub fn element(&self) -> Option<&ItemType> {
        match self {
            ItemType::Array(t) | ItemType::Bag(t) | ItemType::Set(t) | ItemType::Map(t) => Some(t),
            _ => None,
        }
    }

    /// The single target type name of a reference, when unambiguous.
    pub fn reference_target(&self) -> Option<&str> {
        match self {
            ItemType::ReferenceToId(t) | ItemType::ReferenceToObj(t) if t.len() == 1 => {
                Some(&t[0])
            }
            _ => None,
        }
    }
}

/// One schema rule of a recipe.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub itemprop: String,
    pub itemtype: ItemType,
    pub is_id: bool,
    pub optional: bool,
}

impl Rule {
    pub fn new(itemprop: impl Into<String>, itemtype: ItemType) -> Self {
        Self {
            itemprop: itemprop.into(),
            itemtype,
            is_id: false,
            optional: false,
        }
    }

    pub fn id(mut self) -> Self {
        self.is_id = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Identifier of a crdt merge algorithm (§crdt).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AlgorithmId {
    Register,
    Set,
    OptionalValue,
    ReferenceToObject,
    LinkedList,
    NotAvailable,
}

impl std::fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            AlgorithmId::Register => "Register",
            AlgorithmId::Set => "Set",
            AlgorithmId::OptionalValue => "OptionalValue",
            AlgorithmId::ReferenceToObject => "ReferenceToObject",
            AlgorithmId::LinkedList => "LinkedList",
            AlgorithmId::NotAvailable => "NotAvailable",
        };
        write!(f, "{}", name)
    }
}

/// The default algorithm for an element type, used when no config
/// pattern matches.
pub fn default_algorithm(itemtype: &ItemType) -> AlgorithmId {
    match itemtype {
        ItemType::String
        | ItemType::Integer
        | ItemType::Number
        | ItemType::Boolean
        | ItemType::Stringifiable
        | ItemType::ReferenceToId(_)
        | ItemType::ReferenceToClob
        | ItemType::ReferenceToBlob => AlgorithmId::Register,
        ItemType::ReferenceToObj(_) => AlgorithmId::ReferenceToObject,
        ItemType::Array(_) | ItemType::Bag(_) | ItemType::Set(_) => AlgorithmId::Set,
        ItemType::Map(_) | ItemType::Object(_) => AlgorithmId::NotAvailable,
    }
}

/// One step of a concrete recipe path, as walked by the differ.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathSeg {
    /// Field name or map key.
    pub name: String,
    /// Element type name, when the element is a typed object reference.
    pub type_name: Option<String>,
}

impl PathSeg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
        }
    }

    pub fn typed(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: Some(ty.into()),
        }
    }
}

/// Renders a path the way transformation maps key it: `a.b.c`.
pub fn path_string(path: &[PathSeg]) -> String {
    path.iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum PatternSeg {
    Literal(String),
    Wildcard,
    LiteralTyped(String, String),
    WildcardTyped(String),
}

impl PatternSeg {
    fn matches(&self, seg: &PathSeg) -> bool {
        match self {
            PatternSeg::Literal(name) => *name == seg.name,
            PatternSeg::Wildcard => true,
            PatternSeg::LiteralTyped(name, ty) => {
                *name == seg.name && seg.type_name.as_deref() == Some(ty)
            }
            PatternSeg::WildcardTyped(ty) => seg.type_name.as_deref() == Some(ty),
        }
    }

    fn priority(&self) -> u8 {
        match self {
            PatternSeg::LiteralTyped(..) => 4,
            PatternSeg::WildcardTyped(_) => 3,
            PatternSeg::Literal(_) => 2,
            PatternSeg::Wildcard => 1,
        }
    }
}

/// A path pattern of the crdt configuration.
///
/// Grammar: literal field names joined by `.`; `*` matches any one
/// element; a `#TypeName` suffix narrows a segment by element type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathPattern(Vec<PatternSeg>);

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::codec("empty crdt path pattern"));
        }
        let mut segs = Vec::new();
        for part in pattern.split('.') {
            let (name, ty) = match part.split_once('#') {
                Some((name, ty)) if !ty.is_empty() => (name, Some(ty)),
                Some(_) => return Err(Error::codec(format!("bad pattern segment {:?}", part))),
                None => (part, None),
            };
            let seg = match (name, ty) {
                ("*", Some(ty)) => PatternSeg::WildcardTyped(ty.to_owned()),
                ("*", None) => PatternSeg::Wildcard,
                ("", _) => return Err(Error::codec(format!("bad pattern segment {:?}", part))),
                (name, Some(ty)) => PatternSeg::LiteralTyped(name.to_owned(), ty.to_owned()),
                (name, None) => PatternSeg::Literal(name.to_owned()),
            };
            segs.push(seg);
        }
        Ok(Self(segs))
    }

    /// Returns the match priority when the pattern covers the whole path.
    /// Ambiguity between patterns is resolved by the priority of the
    /// final segment: `literal#type`=4, `*#type`=3, `literal`=2, `*`=1.
    pub fn matches(&self, path: &[PathSeg]) -> Option<u8> {
        if self.0.len() != path.len() {
            return None;
        }
        for (pat, seg) in self.0.iter().zip(path) {
            if !pat.matches(seg) {
                return None;
            }
        }
        self.0.last().map(PatternSeg::priority)
    }
}

/// Path-scoped algorithm selection for one recipe.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrdtConfig(Vec<(PathPattern, AlgorithmId)>);

impl CrdtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pattern: &str, algorithm: AlgorithmId) -> Result<Self> {
        self.0.push((PathPattern::parse(pattern)?, algorithm));
        Ok(self)
    }

    /// The configured algorithm for a concrete path, if any pattern
    /// matches. Highest pattern priority wins.
    pub fn configured(&self, path: &[PathSeg]) -> Option<AlgorithmId> {
        let mut best: Option<(u8, AlgorithmId)> = None;
        for (pattern, algorithm) in &self.0 {
            if let Some(priority) = pattern.matches(path) {
                if best.map_or(true, |(p, _)| priority > p) {
                    best = Some((priority, *algorithm));
                }
            }
        }
        best.map(|(_, a)| a)
    }

    /// Selects the algorithm for a concrete path, falling back to the
    /// element-type default.
    pub fn select(&self, path: &[PathSeg], itemtype: &ItemType) -> AlgorithmId {
        self.configured(path)
            .unwrap_or_else(|| default_algorithm(itemtype))
    }
}

/// A registered object schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Recipe {
    pub name: String,
    pub rules: Vec<Rule>,
    pub crdt_config: CrdtConfig,
    /// Itemprops whose reference targets are indexed in the reverse map.
    pub reverse_maps: Vec<String>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
            crdt_config: CrdtConfig::new(),
            reverse_maps: Vec::new(),
        }
    }

    pub fn with_crdt_config(mut self, config: CrdtConfig) -> Self {
        self.crdt_config = config;
        self
    }

    pub fn with_reverse_map(mut self, itemprop: impl Into<String>) -> Self {
        self.reverse_maps.push(itemprop.into());
        self
    }

    pub fn rule(&self, itemprop: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.itemprop == itemprop)
    }

    pub fn id_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.is_id)
    }

    pub fn has_id(&self) -> bool {
        self.rules.iter().any(|r| r.is_id)
    }
}

/// Recipe registry, populated at initialization.
#[derive(Clone)]
pub struct RecipeRegistry {
    table: Arc<RwLock<BTreeMap<String, Arc<Recipe>>>>,
}

impl RecipeRegistry {
    /// Creates a registry holding the builtin recipes.
    pub fn new() -> Self {
        let registry = Self {
            table: Arc::new(RwLock::new(BTreeMap::new())),
        };
        for recipe in builtins() {
            registry
                .register(recipe)
                .unwrap_or_else(|_| unreachable!("builtin recipes are well formed"));
        }
        registry
    }

    pub fn register(&self, recipe: Recipe) -> Result<()> {
        validate_rules(&recipe.name, &recipe.rules)?;
        self.table
            .write()
            .insert(recipe.name.clone(), Arc::new(recipe));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Recipe>> {
        self.table
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipe(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }
}

impl Default for RecipeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_rules(name: &str, rules: &[Rule]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for rule in rules {
        if rule.itemprop.is_empty()
            || rule
                .itemprop
                .bytes()
                .any(|b| !(b.is_ascii_alphanumeric() || b == b'_' || b == b'-'))
        {
            return Err(Error::codec(format!(
                "recipe {}: bad itemprop {:?}",
                name, rule.itemprop
            )));
        }
        if !seen.insert(&rule.itemprop) {
            return Err(Error::codec(format!(
                "recipe {}: duplicate itemprop {:?}",
                name, rule.itemprop
            )));
        }
        if let ItemType::Object(nested) = &rule.itemtype {
            validate_rules(name, nested)?;
        }
    }
    Ok(())
}

/// Recipes the core itself depends on.
fn builtins() -> Vec<Recipe> {
    let creation_time = Recipe::new(
        "CreationTime",
        vec![
            Rule::new("timestamp", ItemType::Integer),
            Rule::new("data", ItemType::ReferenceToObj(vec![])),
        ],
    );
    let linked_list_entry = Recipe::new(
        "LinkedListEntry",
        vec![
            Rule::new(
                "data",
                ItemType::ReferenceToObj(vec!["CreationTime".to_owned()]),
            ),
            Rule::new(
                "metadata",
                ItemType::Array(Box::new(ItemType::ReferenceToObj(vec![]))),
            )
            .optional(),
            Rule::new(
                "previous",
                ItemType::ReferenceToObj(vec!["LinkedListEntry".to_owned()]),
            )
            .optional(),
        ],
    );
    let channel_info = Recipe::new(
        "ChannelInfo",
        vec![
            Rule::new("id", ItemType::String).id(),
            Rule::new("owner", ItemType::ReferenceToId(vec!["Person".to_owned()]))
                .id()
                .optional(),
            Rule::new(
                "head",
                ItemType::ReferenceToObj(vec!["LinkedListEntry".to_owned()]),
            )
            .optional(),
        ],
    )
    .with_crdt_config(
        CrdtConfig::new()
            .with("head", AlgorithmId::LinkedList)
            .unwrap_or_else(|_| unreachable!("pattern is well formed")),
    );
    let person = Recipe::new("Person", vec![Rule::new("email", ItemType::String).id()]);
    let instance = Recipe::new(
        "Instance",
        vec![
            Rule::new("name", ItemType::String).id(),
            Rule::new("owner", ItemType::ReferenceToId(vec!["Person".to_owned()])).id(),
        ],
    );
    let keys = Recipe::new(
        "Keys",
        vec![
            Rule::new("owner", ItemType::ReferenceToId(vec![])).id(),
            Rule::new("publicKey", ItemType::String),
            Rule::new("publicSignKey", ItemType::String),
        ],
    )
    .with_reverse_map("owner");
    vec![
        creation_time,
        linked_list_entry,
        channel_info,
        person,
        instance,
        keys,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(name: &str) -> PathSeg {
        PathSeg::new(name)
    }

    #[test]
    fn pattern_priorities() {
        let config = CrdtConfig::new()
            .with("*", AlgorithmId::Set)
            .unwrap()
            .with("head", AlgorithmId::LinkedList)
            .unwrap()
            .with("*#LinkedListEntry", AlgorithmId::NotAvailable)
            .unwrap()
            .with("head#LinkedListEntry", AlgorithmId::Register)
            .unwrap();
        // literal#type beats *#type beats literal beats *
        let typed = vec![PathSeg::typed("head", "LinkedListEntry")];
        assert_eq!(
            config.select(&typed, &ItemType::String),
            AlgorithmId::Register
        );
        let untyped = vec![seg("head")];
        assert_eq!(
            config.select(&untyped, &ItemType::String),
            AlgorithmId::LinkedList
        );
        let other = vec![seg("tail")];
        assert_eq!(config.select(&other, &ItemType::String), AlgorithmId::Set);
    }

    #[test]
    fn pattern_falls_back_to_type_default() {
        let config = CrdtConfig::new();
        assert_eq!(
            config.select(&[seg("x")], &ItemType::Integer),
            AlgorithmId::Register
        );
        assert_eq!(
            config.select(&[seg("x")], &ItemType::ReferenceToObj(vec![])),
            AlgorithmId::ReferenceToObject
        );
        assert_eq!(
            config.select(&[seg("x")], &ItemType::Map(Box::new(ItemType::String))),
            AlgorithmId::NotAvailable
        );
    }

    #[test]
    fn pattern_length_must_match() {
        let pattern = PathPattern::parse("a.*").unwrap();
        assert!(pattern.matches(&[seg("a")]).is_none());
        assert_eq!(pattern.matches(&[seg("a"), seg("b")]), Some(1));
    }

    #[test]
    fn registry_refuses_unknown_and_duplicates() {
        let registry = RecipeRegistry::new();
        assert!(registry.get("Nope").is_err());
        assert!(registry.contains("LinkedListEntry"));
        let bad = Recipe::new(
            "Bad",
            vec![
                Rule::new("a", ItemType::String),
                Rule::new("a", ItemType::Integer),
            ],
        );
        assert!(registry.register(bad).is_err());
    }
}
