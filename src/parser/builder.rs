use encoding_rs::Encoding;

use crate::sax::{EntityResolver, EventSink};

use super::{Config, Parser};

/// Builder for configuring a new [`Parser`].
///
/// ```
/// use quick_sax::{NullSink, ParserBuilder};
///
/// let mut parser = ParserBuilder::new()
///     .validation(true)
///     .encoding_hint("utf-8")
///     .build(NullSink);
/// parser.feed(b"<doc/>").unwrap();
/// parser.finish().unwrap();
/// ```
pub struct ParserBuilder {
    config: Config,
    system_id: Option<String>,
    public_id: Option<String>,
    encoding_hint: Option<&'static Encoding>,
    resolver: Option<Box<dyn EntityResolver>>,
}

impl Default for ParserBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            system_id: None,
            public_id: None,
            encoding_hint: None,
            resolver: None,
        }
    }

    /// Changes whether names are processed for namespaces.
    ///
    /// When set to `true` (the default), qualified names are expanded
    /// against the in-scope declarations, prefix mapping events are
    /// delivered and namespace well-formedness (single colon, bound
    /// prefixes, reserved prefixes) is enforced. When set to `false`,
    /// names are reported as written and colons are not interpreted.
    pub fn namespaces(mut self, val: bool) -> Self {
        self.config.namespaces = val;
        self
    }

    /// Changes whether `xmlns` attributes appear in the attributes view.
    ///
    /// When set to `true` (the default), namespace declaration attributes
    /// are reported alongside ordinary attributes. Prefix mapping events
    /// are delivered either way.
    pub fn namespace_prefixes(mut self, val: bool) -> Self {
        self.config.namespace_prefixes = val;
        self
    }

    /// Changes whether the document is validated against its DTD.
    ///
    /// When set to `true`, content models, attribute types, attribute
    /// presence and ID/IDREF consistency are checked and violations are
    /// reported through the sink's error hook; the parse continues unless
    /// the sink aborts. Well-formedness is enforced regardless.
    ///
    /// (`false` by default)
    pub fn validation(mut self, val: bool) -> Self {
        self.config.validation = val;
        self
    }

    /// Changes whether external general entities are expanded.
    ///
    /// When set to `false` (the default), a reference to an external
    /// parsed entity is skipped with a warning instead of being resolved
    /// and parsed.
    pub fn external_general_entities(mut self, val: bool) -> Self {
        self.config.external_general_entities = val;
        self
    }

    /// Changes whether external parameter entities and the external DTD
    /// subset are loaded.
    ///
    /// (`false` by default)
    pub fn external_parameter_entities(mut self, val: bool) -> Self {
        self.config.external_parameter_entities = val;
        self
    }

    /// Sets the system identifier of the document entity, used as the
    /// base URI for resolving relative system identifiers.
    pub fn system_id(mut self, val: impl Into<String>) -> Self {
        self.system_id = Some(val.into());
        self
    }

    /// Sets the public identifier of the document entity.
    pub fn public_id(mut self, val: impl Into<String>) -> Self {
        self.public_id = Some(val.into());
        self
    }

    /// Sets the charset assumed when neither a byte order mark nor an XML
    /// declaration names one. Unknown labels are ignored and the UTF-8
    /// default stays in effect.
    pub fn encoding_hint(mut self, label: &str) -> Self {
        self.encoding_hint = Encoding::for_label(label.as_bytes());
        self
    }

    /// Sets the resolver consulted for external entities.
    pub fn entity_resolver<R: EntityResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Builds a [`Parser`] delivering events to the given sink.
    pub fn build<S: EventSink>(self, sink: S) -> Parser<S> {
        Parser::with_config(
            sink,
            self.config,
            self.system_id,
            self.public_id,
            self.encoding_hint,
            self.resolver,
        )
    }
}
