use std::collections::BTreeMap;

/// Request/response multiplicity of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodShape {
    Unary,
    StreamingRequest,
    StreamingResponse,
    Bidirectional,
}

impl MethodShape {
    /// Only the two stream flags are consulted.
    pub fn classify(request_stream: bool, response_stream: bool) -> Self {
        match (request_stream, response_stream) {
            (false, false) => MethodShape::Unary,
            (true, false) => MethodShape::StreamingRequest,
            (false, true) => MethodShape::StreamingResponse,
            (true, true) => MethodShape::Bidirectional,
        }
    }

    pub fn request_is_stream(self) -> bool {
        matches!(self, MethodShape::StreamingRequest | MethodShape::Bidirectional)
    }

    pub fn response_is_stream(self) -> bool {
        matches!(self, MethodShape::StreamingResponse | MethodShape::Bidirectional)
    }
}

/// Method entry of generated service metadata. Missing flags mean `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub path: String,
    pub request_stream: bool,
    pub response_stream: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn request_stream(mut self, flag: bool) -> Self {
        self.request_stream = flag;
        self
    }

    pub fn response_stream(mut self, flag: bool) -> Self {
        self.response_stream = flag;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    path: String,
    shape: MethodShape,
}

impl MethodEntry {
    /// Engine routing path; falls back to the method name.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn shape(&self) -> MethodShape {
        self.shape
    }
}

/// Immutable, pre-classified view of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeMap<String, MethodEntry>,
}

impl ServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        methods: impl IntoIterator<Item = MethodDescriptor>,
    ) -> Self {
        let methods = methods
            .into_iter()
            .map(|method| {
                let shape = MethodShape::classify(method.request_stream, method.response_stream);
                let path = if method.path.is_empty() {
                    method.name.clone()
                } else {
                    method.path
                };
                (method.name, MethodEntry { path, shape })
            })
            .collect();
        Self {
            name: name.into(),
            methods,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self, method: &str) -> Option<MethodShape> {
        self.methods.get(method).map(MethodEntry::shape)
    }

    pub fn method(&self, method: &str) -> Option<&MethodEntry> {
        self.methods.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodEntry)> {
        self.methods.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
