use heck::ToUpperCamelCase;
use syn::{meta::ParseNestedMeta, Attribute, Ident, LitStr, Type};

/// The association kinds accepted inside `#[entity(...)]`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    HasOne,
    BelongsTo,
    HasMany,
    ManyToMany,
}

impl Kind {
    fn from_meta(meta: &ParseNestedMeta) -> Option<Self> {
        let ident = meta.path.get_ident()?.to_string();
        match ident.as_str() {
            "has_one" => Some(Kind::HasOne),
            "belongs_to" => Some(Kind::BelongsTo),
            "has_many" => Some(Kind::HasMany),
            "has_and_belongs_to_many" => Some(Kind::ManyToMany),
            _ => None,
        }
    }

    /// Name of the attribute, which is also the `EntityDeclaration` builder method.
    pub fn attr_name(self) -> &'static str {
        match self {
            Kind::HasOne => "has_one",
            Kind::BelongsTo => "belongs_to",
            Kind::HasMany => "has_many",
            Kind::ManyToMany => "has_and_belongs_to_many",
        }
    }

    fn is_one_to_one(self) -> bool {
        matches!(self, Kind::HasOne | Kind::BelongsTo)
    }
}

/// One `has_many(comments, target = Comment, ...)` declaration.
pub struct Association {
    pub kind: Kind,
    pub name: Ident,
    pub target: Type,
    pub foreign_key: Option<LitStr>,
    pub join_table: Option<LitStr>,
    pub partner_key: Option<LitStr>,
    pub conditions: Option<LitStr>,
    pub strict: bool,
}

/// Everything declared through struct-level `#[entity(...)]` attributes.
#[derive(Default)]
pub struct EntityAttrs {
    pub table: Option<LitStr>,
    pub partitions: Vec<LitStr>,
    pub serialized: Vec<LitStr>,
    pub custom_hooks: bool,
    pub associations: Vec<Association>,
}

impl EntityAttrs {
    pub fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut parsed = Self::default();

        for attr in attrs.iter().filter(|a| a.path().is_ident("entity")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("table") {
                    parsed.table = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("partition") {
                    parsed.partitions.push(meta.value()?.parse()?);
                } else if meta.path.is_ident("serialize") {
                    parsed.serialized.push(meta.value()?.parse()?);
                } else if meta.path.is_ident("custom_hooks") {
                    parsed.custom_hooks = true;
                } else if let Some(kind) = Kind::from_meta(&meta) {
                    parsed.associations.push(parse_association(kind, &meta)?);
                } else {
                    return Err(meta.error("unsupported entity attribute"));
                }
                Ok(())
            })?;
        }

        Ok(parsed)
    }
}

fn parse_association(kind: Kind, meta: &ParseNestedMeta) -> syn::Result<Association> {
    let mut name: Option<Ident> = None;
    let mut target: Option<Type> = None;
    let mut foreign_key = None;
    let mut join_table = None;
    let mut partner_key = None;
    let mut conditions = None;
    let mut strict = false;

    meta.parse_nested_meta(|option| {
        if option.path.is_ident("target") {
            target = Some(option.value()?.parse()?);
        } else if option.path.is_ident("foreign_key") {
            foreign_key = Some(option.value()?.parse()?);
        } else if option.path.is_ident("join_table") {
            join_table = Some(option.value()?.parse()?);
        } else if option.path.is_ident("partner_key") {
            partner_key = Some(option.value()?.parse()?);
        } else if option.path.is_ident("conditions") {
            conditions = Some(option.value()?.parse()?);
        } else if option.path.is_ident("strict") {
            strict = true;
        } else if name.is_none() {
            name = Some(option.path.require_ident()?.clone());
        } else {
            return Err(option.error("unsupported association option"));
        }
        Ok(())
    })?;

    let name = name.ok_or_else(|| meta.error("association name missing"))?;
    let target = match target {
        Some(target) => target,
        None if kind.is_one_to_one() => {
            let ident = Ident::new(&name.to_string().to_upper_camel_case(), name.span());
            syn::parse_quote!(#ident)
        }
        None => return Err(meta.error(format!("{} requires `target = Type`", kind.attr_name()))),
    };

    Ok(Association { kind, name, target, foreign_key, join_table, partner_key, conditions, strict })
}

/// `#[entity(record)]` marks the field holding the `Record`.
pub fn is_record_marker(attr: &Attribute) -> bool {
    attr.path().is_ident("entity") && attr.parse_args::<Ident>().is_ok_and(|ident| ident == "record")
}

/// Whether a field type is spelled `Record` (optionally path-qualified).
pub fn is_record_type(ty: &Type) -> bool {
    match ty {
        Type::Path(type_path) => type_path.path.segments.last().is_some_and(|segment| segment.ident == "Record"),
        _ => false,
    }
}
