//! Canonical text encoding of typed objects.
//!
//! The encoded form is the hash pre-image, so it is fixed down to the
//! byte: fields follow recipe rule order, map entries ascend by key
//! bytes, `set`/`bag` elements ascend by the hash of their own encoding,
//! numbers use the shortest round-trip form and strings are normalized
//! to NFC.
//!
//! ```bnf
//! object  := '<' type-name '>' '{' field* '}'
//! idobj   := '<' 'id' '|' type-name '>' '{' field* '}'
//! field   := itemprop ':' value ';'
//! string  := '"' escaped '"'
//! number  := 'n' shortest-roundtrip-f64
//! idref   := 'id@' hex64      objref  := 'ref@' hex64
//! clobref := 'clob@' hex64    blobref := 'blob@' hex64
//! array   := '[' (value ',')* ']'
//! bag     := 'b[' (value ',')* ']'
//! set     := 's[' (value ',')* ']'
//! map     := 'm{' (string ':' value ';')* '}'
//! ```

use crate::error::{Error, Result};
use crate::hash::{sha256, Hash, IdHash};
use crate::recipe::{ItemType, RecipeRegistry, Rule};
use crate::value::{Obj, Value};
use std::collections::BTreeMap;
use unicode_normalization::UnicodeNormalization;

/// Encodes an object to its canonical form, validating it against its
/// recipe.
pub fn encode(obj: &Obj, recipes: &RecipeRegistry) -> Result<String> {
    let recipe = recipes.get(obj.type_name())?;
    let mut out = String::new();
    out.push('<');
    out.push_str(&recipe.name);
    out.push('>');
    encode_fields(&recipe.rules, obj, |_| true, recipes, &mut out)?;
    Ok(out)
}

/// Encodes only the id-marked fields, wrapped in the id-object marker.
/// The hash of this form is the object's id-hash.
pub fn encode_id(obj: &Obj, recipes: &RecipeRegistry) -> Result<String> {
    let recipe = recipes.get(obj.type_name())?;
    if !recipe.has_id() {
        return Err(Error::codec(format!(
            "recipe {} has no id fields",
            recipe.name
        )));
    }
    let mut out = String::new();
    out.push_str("<id|");
    out.push_str(&recipe.name);
    out.push('>');
    encode_fields(&recipe.rules, obj, |r| r.is_id, recipes, &mut out)?;
    Ok(out)
}

/// Content hash of the canonical encoding.
pub fn hash_of(obj: &Obj, recipes: &RecipeRegistry) -> Result<Hash> {
    Ok(Hash::digest(encode(obj, recipes)?.as_bytes()))
}

/// Id-hash of a versioned object.
pub fn id_hash_of(obj: &Obj, recipes: &RecipeRegistry) -> Result<IdHash> {
    Ok(IdHash::digest(encode_id(obj, recipes)?.as_bytes()))
}

fn encode_fields(
    rules: &[Rule],
    obj: &Obj,
    keep: impl Fn(&Rule) -> bool,
    recipes: &RecipeRegistry,
    out: &mut String,
) -> Result<()> {
    for prop in obj.fields().keys() {
        if !rules.iter().any(|r| r.itemprop == *prop) {
            return Err(Error::codec(format!(
                "{}: field {:?} not in recipe",
                obj.type_name(),
                prop
            )));
        }
    }
    out.push('{');
    for rule in rules.iter().filter(|&r| keep(r)) {
        match obj.get(&rule.itemprop) {
            Some(value) => {
                out.push_str(&rule.itemprop);
                out.push(':');
                encode_value(value, &rule.itemtype, recipes, out)?;
                out.push(';');
            }
            None if rule.optional => {}
            None => {
                return Err(Error::codec(format!(
                    "{}: missing field {:?}",
                    obj.type_name(),
                    rule.itemprop
                )));
            }
        }
    }
    out.push('}');
    Ok(())
}

fn encode_nested(rules: &[Rule], fields: &BTreeMap<String, Value>, recipes: &RecipeRegistry, out: &mut String) -> Result<()> {
    for prop in fields.keys() {
        if !rules.iter().any(|r| r.itemprop == *prop) {
            return Err(Error::codec(format!("field {:?} not in nested rules", prop)));
        }
    }
    out.push('{');
    for rule in rules {
        match fields.get(&rule.itemprop) {
            Some(value) => {
                out.push_str(&rule.itemprop);
                out.push(':');
                encode_value(value, &rule.itemtype, recipes, out)?;
                out.push(';');
            }
            None if rule.optional => {}
            None => {
                return Err(Error::codec(format!("missing field {:?}", rule.itemprop)));
            }
        }
    }
    out.push('}');
    Ok(())
}

fn encode_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.nfc() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn encode_value(
    value: &Value,
    itemtype: &ItemType,
    recipes: &RecipeRegistry,
    out: &mut String,
) -> Result<()> {
    match (value, itemtype) {
        (Value::String(s), ItemType::String | ItemType::Stringifiable) => {
            encode_string(s, out);
        }
        (Value::Integer(i), ItemType::Integer) => {
            out.push_str(&i.to_string());
        }
        (Value::Number(f), ItemType::Number) => {
            if !f.is_finite() {
                return Err(Error::codec("number must be finite"));
            }
            out.push('n');
            out.push_str(&f.to_string());
        }
        (Value::Boolean(b), ItemType::Boolean) => {
            out.push_str(if *b { "true" } else { "false" });
        }
        (Value::IdRef(h), ItemType::ReferenceToId(_)) => {
            out.push_str("id@");
            out.push_str(&h.to_hex());
        }
        (Value::ObjRef(h), ItemType::ReferenceToObj(_)) => {
            out.push_str("ref@");
            out.push_str(&h.to_hex());
        }
        (Value::ClobRef(h), ItemType::ReferenceToClob) => {
            out.push_str("clob@");
            out.push_str(&h.to_hex());
        }
        (Value::BlobRef(h), ItemType::ReferenceToBlob) => {
            out.push_str("blob@");
            out.push_str(&h.to_hex());
        }
        (Value::Array(items), ItemType::Array(element)) => {
            out.push('[');
            for item in items {
                encode_value(item, element, recipes, out)?;
                out.push(',');
            }
            out.push(']');
        }
        (Value::Bag(items), ItemType::Bag(element)) => {
            out.push_str("b[");
            for item in sort_by_element_hash(items, element, recipes, false)? {
                out.push_str(&item);
                out.push(',');
            }
            out.push(']');
        }
        (Value::Set(items), ItemType::Set(element)) => {
            out.push_str("s[");
            for item in sort_by_element_hash(items, element, recipes, true)? {
                out.push_str(&item);
                out.push(',');
            }
            out.push(']');
        }
        (Value::Map(entries), ItemType::Map(element)) => {
            let mut normalized = BTreeMap::new();
            for (key, value) in entries {
                let key: String = key.nfc().collect();
                if normalized.insert(key.clone(), value).is_some() {
                    return Err(Error::codec(format!("duplicate map key {:?}", key)));
                }
            }
            out.push_str("m{");
            for (key, value) in normalized {
                encode_string(&key, out);
                out.push(':');
                encode_value(value, element, recipes, out)?;
                out.push(';');
            }
            out.push('}');
        }
        (Value::Object(fields), ItemType::Object(rules)) => {
            encode_nested(rules, fields, recipes, out)?;
        }
        (value, itemtype) => {
            return Err(Error::codec(format!(
                "value {:?} does not match type {:?}",
                value, itemtype
            )));
        }
    }
    Ok(())
}

/// Encodes each element on its own and orders the encodings by their
/// SHA-256. Sets additionally collapse equal elements.
fn sort_by_element_hash(
    items: &[Value],
    element: &ItemType,
    recipes: &RecipeRegistry,
    dedup: bool,
) -> Result<Vec<String>> {
    let mut encoded = Vec::with_capacity(items.len());
    for item in items {
        let mut s = String::new();
        encode_value(item, element, recipes, &mut s)?;
        encoded.push((sha256(s.as_bytes()), s));
    }
    encoded.sort();
    if dedup {
        encoded.dedup_by(|a, b| a.0 == b.0);
    }
    Ok(encoded.into_iter().map(|(_, s)| s).collect())
}

/// Decodes a canonical encoding back into an object.
pub fn decode(text: &str, recipes: &RecipeRegistry) -> Result<Obj> {
    let mut p = Parser::new(text);
    p.expect('<')?;
    let name = p.take_until('>')?.to_owned();
    if name.starts_with("id|") {
        return Err(Error::codec("id-objects are hashed, never stored"));
    }
    let recipe = recipes.get(&name)?;
    let fields = p.parse_fields(&recipe.rules, recipes)?;
    p.end()?;
    let mut obj = Obj::new(recipe.name.clone());
    for (prop, value) in fields {
        obj.set(prop, value);
    }
    Ok(obj)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Result<char> {
        let c = self.peek().ok_or_else(|| Error::codec("unexpected end"))?;
        self.pos += c.len_utf8();
        Ok(c)
    }

    fn expect(&mut self, c: char) -> Result<()> {
        let got = self.bump()?;
        if got != c {
            return Err(Error::codec(format!(
                "expected {:?} at byte {}, got {:?}",
                c,
                self.pos - got.len_utf8(),
                got
            )));
        }
        Ok(())
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn take_until(&mut self, delim: char) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .find(delim)
            .ok_or_else(|| Error::codec(format!("missing {:?}", delim)))?;
        let taken = &rest[..end];
        self.pos += end + delim.len_utf8();
        Ok(taken)
    }

    fn end(&self) -> Result<()> {
        if self.pos != self.input.len() {
            return Err(Error::codec(format!(
                "trailing input at byte {}",
                self.pos
            )));
        }
        Ok(())
    }

    fn parse_fields(
        &mut self,
        rules: &[Rule],
        recipes: &RecipeRegistry,
    ) -> Result<BTreeMap<String, Value>> {
        self.expect('{')?;
        let mut fields = BTreeMap::new();
        let mut next_rule = 0;
        while self.peek() != Some('}') {
            let prop = self.take_until(':')?;
            // canonical order: the field must match the next rule, with
            // absent rules in between all optional
            let index = rules[next_rule..]
                .iter()
                .position(|r| r.itemprop == prop)
                .map(|i| i + next_rule)
                .ok_or_else(|| Error::codec(format!("field {:?} out of order", prop)))?;
            if rules[next_rule..index].iter().any(|r| !r.optional) {
                return Err(Error::codec(format!(
                    "field {:?} skips a required field",
                    prop
                )));
            }
            let value = self.parse_value(&rules[index].itemtype, recipes)?;
            self.expect(';')?;
            fields.insert(prop.to_owned(), value);
            next_rule = index + 1;
        }
        if rules[next_rule..].iter().any(|r| !r.optional) {
            return Err(Error::codec("missing required field"));
        }
        self.expect('}')?;
        Ok(fields)
    }

    fn parse_string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.bump()? {
                '"' => return Ok(s),
                '\\' => match self.bump()? {
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    'n' => s.push('\n'),
                    'r' => s.push('\r'),
                    't' => s.push('\t'),
                    '0' => s.push('\0'),
                    c => return Err(Error::codec(format!("bad escape {:?}", c))),
                },
                c => s.push(c),
            }
        }
    }

    fn parse_hash_suffix(&mut self) -> Result<[u8; 32]> {
        let rest = self.rest();
        if rest.len() < 64 {
            return Err(Error::codec("truncated hash"));
        }
        let hex = &rest[..64];
        let mut id = [0; 32];
        hex::decode_to_slice(hex, &mut id).map_err(|err| Error::codec(format!("{}", err)))?;
        if hex.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::codec("hash hex must be lowercase"));
        }
        self.pos += 64;
        Ok(id)
    }

    fn parse_number_literal(&mut self) -> Result<f64> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| matches!(c, ';' | ',' | '}' | ']'))
            .ok_or_else(|| Error::codec("unterminated number"))?;
        let literal = &rest[..end];
        let f: f64 = literal
            .parse()
            .map_err(|_| Error::codec(format!("bad number {:?}", literal)))?;
        if !f.is_finite() {
            return Err(Error::codec("number must be finite"));
        }
        self.pos += end;
        Ok(f)
    }

    fn parse_integer_literal(&mut self) -> Result<i64> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '-'))
            .unwrap_or(rest.len());
        let literal = &rest[..end];
        let i: i64 = literal
            .parse()
            .map_err(|_| Error::codec(format!("bad integer {:?}", literal)))?;
        self.pos += end;
        Ok(i)
    }

    fn parse_value(&mut self, itemtype: &ItemType, recipes: &RecipeRegistry) -> Result<Value> {
        let value = match itemtype {
            ItemType::String | ItemType::Stringifiable => Value::String(self.parse_string()?),
            ItemType::Integer => Value::Integer(self.parse_integer_literal()?),
            ItemType::Number => {
                self.expect('n')?;
                Value::Number(self.parse_number_literal()?)
            }
            ItemType::Boolean => {
                if self.eat("true") {
                    Value::Boolean(true)
                } else if self.eat("false") {
                    Value::Boolean(false)
                } else {
                    return Err(Error::codec("bad boolean"));
                }
            }
            ItemType::ReferenceToId(_) => {
                if !self.eat("id@") {
                    return Err(Error::codec("expected id reference"));
                }
                Value::IdRef(IdHash::new(self.parse_hash_suffix()?))
            }
            ItemType::ReferenceToObj(_) => {
                if !self.eat("ref@") {
                    return Err(Error::codec("expected object reference"));
                }
                Value::ObjRef(Hash::new(self.parse_hash_suffix()?))
            }
            ItemType::ReferenceToClob => {
                if !self.eat("clob@") {
                    return Err(Error::codec("expected clob reference"));
                }
                Value::ClobRef(Hash::new(self.parse_hash_suffix()?))
            }
            ItemType::ReferenceToBlob => {
                if !self.eat("blob@") {
                    return Err(Error::codec("expected blob reference"));
                }
                Value::BlobRef(Hash::new(self.parse_hash_suffix()?))
            }
            ItemType::Array(element) => Value::Array(self.parse_list("[", element, recipes)?),
            ItemType::Bag(element) => Value::Bag(self.parse_list("b[", element, recipes)?),
            ItemType::Set(element) => Value::Set(self.parse_list("s[", element, recipes)?),
            ItemType::Map(element) => {
                if !self.eat("m{") {
                    return Err(Error::codec("expected map"));
                }
                let mut entries = BTreeMap::new();
                while self.peek() != Some('}') {
                    let key = self.parse_string()?;
                    self.expect(':')?;
                    let value = self.parse_value(element, recipes)?;
                    self.expect(';')?;
                    if entries.insert(key.clone(), value).is_some() {
                        return Err(Error::codec(format!("duplicate map key {:?}", key)));
                    }
                }
                self.expect('}')?;
                Value::Map(entries)
            }
            ItemType::Object(rules) => Value::Object(self.parse_fields(rules, recipes)?),
        };
        Ok(value)
    }

    fn parse_list(
        &mut self,
        open: &str,
        element: &ItemType,
        recipes: &RecipeRegistry,
    ) -> Result<Vec<Value>> {
        if !self.eat(open) {
            return Err(Error::codec(format!("expected {:?}", open)));
        }
        let mut items = Vec::new();
        while self.peek() != Some(']') {
            items.push(self.parse_value(element, recipes)?);
            self.expect(',')?;
        }
        self.expect(']')?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{AlgorithmId, CrdtConfig, Recipe};
    use proptest::prelude::*;

    fn registry() -> RecipeRegistry {
        let recipes = RecipeRegistry::new();
        recipes
            .register(Recipe::new(
                "Email",
                vec![Rule::new("email", ItemType::String).id()],
            ))
            .unwrap();
        recipes
            .register(Recipe::new(
                "Sample",
                vec![
                    Rule::new("name", ItemType::String).id(),
                    Rule::new("count", ItemType::Integer),
                    Rule::new("ratio", ItemType::Number).optional(),
                    Rule::new("flag", ItemType::Boolean),
                    Rule::new("tags", ItemType::Set(Box::new(ItemType::String))),
                    Rule::new("notes", ItemType::Map(Box::new(ItemType::String))).optional(),
                ],
            ))
            .unwrap();
        recipes
    }

    #[test]
    fn email_hash_is_stable() {
        let recipes = registry();
        let obj = Obj::new("Email").with("email", "a@b.c");
        let encoded = encode(&obj, &recipes).unwrap();
        assert_eq!(encoded, "<Email>{email:\"a@b.c\";}");
        let hash = hash_of(&obj, &recipes).unwrap();
        assert_eq!(hash, Hash::digest(encoded.as_bytes()));
        // re-encoding the decoded form yields the same hash
        let decoded = decode(&encoded, &recipes).unwrap();
        assert_eq!(hash_of(&decoded, &recipes).unwrap(), hash);
    }

    #[test]
    fn id_encoding_covers_only_id_fields() {
        let recipes = registry();
        let a = Obj::new("Sample")
            .with("name", "x")
            .with("count", 1i64)
            .with("flag", true)
            .with("tags", Value::Set(vec![]));
        let b = Obj::new("Sample")
            .with("name", "x")
            .with("count", 2i64)
            .with("flag", false)
            .with("tags", Value::Set(vec!["t".into()]));
        assert_eq!(encode_id(&a, &recipes).unwrap(), "<id|Sample>{name:\"x\";}");
        assert_eq!(
            id_hash_of(&a, &recipes).unwrap(),
            id_hash_of(&b, &recipes).unwrap()
        );
        assert_ne!(hash_of(&a, &recipes).unwrap(), hash_of(&b, &recipes).unwrap());
    }

    #[test]
    fn set_elements_sort_by_hash_and_dedup() {
        let recipes = registry();
        let a = Obj::new("Sample")
            .with("name", "s")
            .with("count", 0i64)
            .with("flag", false)
            .with(
                "tags",
                Value::Set(vec!["x".into(), "y".into(), "x".into()]),
            );
        let b = Obj::new("Sample")
            .with("name", "s")
            .with("count", 0i64)
            .with("flag", false)
            .with("tags", Value::Set(vec!["y".into(), "x".into()]));
        assert_eq!(
            encode(&a, &recipes).unwrap(),
            encode(&b, &recipes).unwrap()
        );
    }

    #[test]
    fn zero_rule_recipe_is_a_marker() {
        let recipes = RecipeRegistry::new();
        recipes.register(Recipe::new("Empty", vec![])).unwrap();
        let obj = Obj::new("Empty");
        assert_eq!(encode(&obj, &recipes).unwrap(), "<Empty>{}");
    }

    #[test]
    fn unknown_field_and_missing_field_fail() {
        let recipes = registry();
        let unknown = Obj::new("Email").with("email", "a@b.c").with("extra", 1i64);
        assert!(encode(&unknown, &recipes).is_err());
        let missing = Obj::new("Email");
        assert!(encode(&missing, &recipes).is_err());
    }

    #[test]
    fn unknown_recipe_is_refused() {
        let recipes = registry();
        let obj = Obj::new("Nope").with("x", 1i64);
        assert!(matches!(
            encode(&obj, &recipes),
            Err(Error::UnknownRecipe(_))
        ));
    }

    #[test]
    fn number_has_no_trailing_zeros() {
        let recipes = registry();
        let obj = Obj::new("Sample")
            .with("name", "n")
            .with("count", 3i64)
            .with("ratio", Value::Number(1.0))
            .with("flag", true)
            .with("tags", Value::Set(vec![]));
        let encoded = encode(&obj, &recipes).unwrap();
        assert!(encoded.contains("ratio:n1;"), "{}", encoded);
    }

    #[test]
    fn map_keys_sorted_and_escaped_strings_round_trip() {
        let recipes = registry();
        let mut notes = BTreeMap::new();
        notes.insert("b".to_owned(), Value::String("line\nbreak \"q\"".to_owned()));
        notes.insert("a".to_owned(), Value::String("\\".to_owned()));
        let obj = Obj::new("Sample")
            .with("name", "m")
            .with("count", 0i64)
            .with("flag", false)
            .with("tags", Value::Set(vec![]))
            .with("notes", Value::Map(notes));
        let encoded = encode(&obj, &recipes).unwrap();
        let a = encoded.find("\"a\"").unwrap();
        let b = encoded.find("\"b\"").unwrap();
        assert!(a < b);
        let decoded = decode(&encoded, &recipes).unwrap();
        assert_eq!(decoded, obj);
    }

    #[test]
    fn crdt_config_survives_registration() {
        let recipes = RecipeRegistry::new();
        recipes
            .register(
                Recipe::new("Cfg", vec![Rule::new("v", ItemType::Integer)]).with_crdt_config(
                    CrdtConfig::new().with("v", AlgorithmId::Register).unwrap(),
                ),
            )
            .unwrap();
        assert!(recipes.get("Cfg").is_ok());
    }

    prop_compose! {
        fn arb_sample()(
            name in "[a-z]{1,8}",
            count in any::<i64>(),
            flag in any::<bool>(),
            tags in proptest::collection::vec("[a-z]{0,6}", 0..5),
        ) -> Obj {
            Obj::new("Sample")
                .with("name", name)
                .with("count", count)
                .with("flag", flag)
                .with("tags", Value::Set(tags.into_iter().map(Value::String).collect::<Vec<_>>()))
        }
    }

    proptest! {
        #[test]
        fn encode_decode_round_trip(obj in arb_sample()) {
            let recipes = registry();
            let encoded = encode(&obj, &recipes).unwrap();
            let decoded = decode(&encoded, &recipes).unwrap();
            // equality modulo set ordering rules: compare canonical forms
            prop_assert_eq!(encode(&decoded, &recipes).unwrap(), encoded);
        }
    }
}
