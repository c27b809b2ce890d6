use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use fancy_regex::Regex;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    HtmlParse(String),
    Dom(String),
    UnsupportedSelector(String),
    SelectorNotFound(String),
    IndexPattern(String),
    TypeMismatch {
        selector: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HtmlParse(msg) => write!(f, "html parse error: {msg}"),
            Self::Dom(msg) => write!(f, "dom error: {msg}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::SelectorNotFound(selector) => write!(f, "selector not found: {selector}"),
            Self::IndexPattern(msg) => write!(f, "index pattern error: {msg}"),
            Self::TypeMismatch {
                selector,
                expected,
                actual,
            } => write!(
                f,
                "type mismatch for {selector}: expected {expected}, actual {actual}"
            ),
        }
    }
}

impl StdError for Error {}

// Ids index straight into the document's node arena and are never reused:
// nothing in this crate removes nodes, only detaches and re-parents them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeType {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    node_type: NodeType,
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
    value: String,
    checked: bool,
    disabled: bool,
}

impl Element {
    fn from_markup(tag_name: String, attrs: HashMap<String, String>) -> Self {
        Self {
            value: attrs.get("value").cloned().unwrap_or_default(),
            checked: attrs.contains_key("checked"),
            disabled: attrs.contains_key("disabled"),
            tag_name,
            attrs,
        }
    }
}

#[derive(Debug, Clone)]
struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    id_index: HashMap<String, NodeId>,
}

impl Document {
    fn new() -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            id_index: HashMap::new(),
        };
        doc.create_node(None, NodeType::Document);
        doc
    }

    fn create_node(&mut self, parent: Option<NodeId>, node_type: NodeType) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            node_type,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    fn create_element(
        &mut self,
        parent: NodeId,
        tag_name: String,
        attrs: HashMap<String, String>,
    ) -> NodeId {
        let element = Element::from_markup(tag_name, attrs);
        let id_attr = element.attrs.get("id").cloned();
        let node = self.create_node(Some(parent), NodeType::Element(element));
        if let Some(id_attr) = id_attr {
            self.id_index.insert(id_attr, node);
        }
        node
    }

    fn create_text(&mut self, parent: NodeId, text: String) -> NodeId {
        self.create_node(Some(parent), NodeType::Text(text))
    }

    fn element(&self, node_id: NodeId) -> Option<&Element> {
        match &self.nodes[node_id.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node_id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node_id.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.element(node_id).map(|e| e.tag_name.as_str())
    }

    fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes[node_id.0].parent
    }

    fn is_valid_node(&self, node_id: NodeId) -> bool {
        node_id.0 < self.nodes.len()
    }

    fn by_id(&self, id: &str) -> Option<NodeId> {
        self.id_index.get(id).copied()
    }

    fn attr(&self, node_id: NodeId, name: &str) -> Option<String> {
        self.element(node_id)
            .and_then(|element| element.attrs.get(name).cloned())
    }

    fn has_attr(&self, node_id: NodeId, name: &str) -> bool {
        self.element(node_id)
            .map(|element| element.attrs.contains_key(name))
            .unwrap_or(false)
    }

    fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Dom("attribute target is not an element".into()))?;
        element.attrs.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove_attr(&mut self, node_id: NodeId, name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Dom("attribute target is not an element".into()))?;
        element.attrs.remove(name);
        Ok(())
    }

    fn checked(&self, node_id: NodeId) -> bool {
        self.element(node_id)
            .map(|element| element.checked)
            .unwrap_or(false)
    }

    fn set_checked(&mut self, node_id: NodeId, checked: bool) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Dom("checked target is not an element".into()))?;
        element.checked = checked;
        Ok(())
    }

    fn disabled(&self, node_id: NodeId) -> bool {
        self.element(node_id)
            .map(|element| element.disabled)
            .unwrap_or(false)
    }

    fn set_disabled(&mut self, node_id: NodeId, disabled: bool) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Dom("disabled target is not an element".into()))?;
        element.disabled = disabled;
        if disabled {
            element
                .attrs
                .insert("disabled".to_string(), "true".to_string());
        } else {
            element.attrs.remove("disabled");
        }
        Ok(())
    }

    fn value(&self, node_id: NodeId) -> Result<String> {
        let element = self
            .element(node_id)
            .ok_or_else(|| Error::Dom("value target is not an element".into()))?;
        Ok(element.value.clone())
    }

    fn set_value(&mut self, node_id: NodeId, value: &str) -> Result<()> {
        if self
            .tag_name(node_id)
            .map(|tag| tag.eq_ignore_ascii_case("select"))
            .unwrap_or(false)
        {
            return self.set_select_value(node_id, value);
        }

        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Dom("value target is not an element".into()))?;
        element.value = value.to_string();
        Ok(())
    }

    fn text_content(&self, node_id: NodeId) -> String {
        match &self.nodes[node_id.0].node_type {
            NodeType::Document | NodeType::Element(_) => {
                let mut out = String::new();
                for child in &self.nodes[node_id.0].children {
                    out.push_str(&self.text_content(*child));
                }
                out
            }
            NodeType::Text(text) => text.clone(),
        }
    }

    fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if !self.is_valid_node(parent) || !self.is_valid_node(child) {
            return Err(Error::Dom("appendChild node is invalid".into()));
        }

        // Prevent cycles: parent must not be inside child's subtree.
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node == child {
                return Err(Error::Dom("appendChild would create a cycle".into()));
            }
            cursor = self.parent(node);
        }

        if let Some(old_parent) = self.parent(child) {
            self.nodes[old_parent.0].children.retain(|id| *id != child);
        }

        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        Ok(())
    }

    fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: NodeId) -> Result<()> {
        if !self.is_valid_node(child) || !self.is_valid_node(reference) {
            return Err(Error::Dom("insertBefore node is invalid".into()));
        }
        if self.parent(reference) != Some(parent) {
            return Err(Error::Dom(
                "insertBefore reference is not a direct child".into(),
            ));
        }
        if child == reference {
            return Ok(());
        }

        // Prevent cycles: parent must not be inside child's subtree.
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node == child {
                return Err(Error::Dom("insertBefore would create a cycle".into()));
            }
            cursor = self.parent(node);
        }

        if let Some(old_parent) = self.parent(child) {
            self.nodes[old_parent.0].children.retain(|id| *id != child);
        }

        let Some(index) = self.nodes[parent.0]
            .children
            .iter()
            .position(|id| *id == reference)
        else {
            return Err(Error::Dom("insertBefore reference is missing".into()));
        };

        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(index, child);
        Ok(())
    }

    fn insert_after(&mut self, target: NodeId, child: NodeId) -> Result<()> {
        let Some(parent) = self.parent(target) else {
            return Ok(());
        };
        let pos = self.nodes[parent.0]
            .children
            .iter()
            .position(|id| *id == target)
            .ok_or_else(|| Error::Dom("insertAfter target is detached".into()))?;
        let next = self.nodes[parent.0].children.get(pos + 1).copied();
        if let Some(next) = next {
            self.insert_before(parent, child, next)
        } else {
            self.append_child(parent, child)
        }
    }

    fn clone_subtree_from(
        &mut self,
        source: &Document,
        source_node: NodeId,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let node_type = match &source.nodes[source_node.0].node_type {
            NodeType::Document => {
                return Err(Error::Dom("cannot clone a document node".into()));
            }
            NodeType::Element(element) => NodeType::Element(element.clone()),
            NodeType::Text(text) => NodeType::Text(text.clone()),
        };

        let node = self.create_node(parent, node_type);
        for child in &source.nodes[source_node.0].children {
            let _ = self.clone_subtree_from(source, *child, Some(node))?;
        }
        Ok(node)
    }

    fn rebuild_id_index(&mut self) {
        self.id_index.clear();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            let id_attr = self
                .element(node)
                .and_then(|element| element.attrs.get("id").cloned());
            if let Some(id_attr) = id_attr {
                self.id_index.insert(id_attr, node);
            }
            for child in self.nodes[node.0].children.iter().rev() {
                stack.push(*child);
            }
        }
    }

    fn first_element_child(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes[node_id.0]
            .children
            .iter()
            .copied()
            .find(|child| self.element(*child).is_some())
    }

    fn descendant_elements(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[root.0].children.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if self.element(node).is_some() {
                out.push(node);
            }
            for child in self.nodes[node.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    fn find_ancestor_by_tag(&self, node_id: NodeId, tag: &str) -> Option<NodeId> {
        let mut cursor = self.parent(node_id);
        while let Some(current) = cursor {
            if self
                .tag_name(current)
                .map(|name| name.eq_ignore_ascii_case(tag))
                .unwrap_or(false)
            {
                return Some(current);
            }
            cursor = self.parent(current);
        }
        None
    }

    fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        self.query_selector_from(self.root, selector)
    }

    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        self.query_selector_all_from(self.root, selector)
    }

    fn query_selector_from(&self, root: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let groups = parse_selector_groups(selector)?;
        for node in self.descendant_elements(root) {
            if self.matches_any_group(node, &groups) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    fn query_selector_all_from(&self, root: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;
        let mut out = Vec::new();
        for node in self.descendant_elements(root) {
            if self.matches_any_group(node, &groups) {
                out.push(node);
            }
        }
        Ok(out)
    }

    fn matches_any_group(&self, node_id: NodeId, groups: &[Vec<SelectorStep>]) -> bool {
        groups
            .iter()
            .any(|steps| self.matches_selector_chain(node_id, steps))
    }

    fn matches_selector_chain(&self, node_id: NodeId, steps: &[SelectorStep]) -> bool {
        let Some(last) = steps.last() else {
            return false;
        };
        if !self.matches_step(node_id, last) {
            return false;
        }

        let mut remaining = &steps[..steps.len() - 1];
        let mut cursor = self.parent(node_id);
        while let Some(current) = cursor {
            if remaining.is_empty() {
                break;
            }
            if let Some(step) = remaining.last() {
                if self.matches_step(current, step) {
                    remaining = &remaining[..remaining.len() - 1];
                }
            }
            cursor = self.parent(current);
        }
        remaining.is_empty()
    }

    fn matches_step(&self, node_id: NodeId, step: &SelectorStep) -> bool {
        let Some(element) = self.element(node_id) else {
            return false;
        };

        if let Some(tag) = &step.tag {
            if !element.tag_name.eq_ignore_ascii_case(tag) {
                return false;
            }
        }

        if let Some(id) = &step.id {
            if element.attrs.get("id") != Some(id) {
                return false;
            }
        }

        for class in &step.classes {
            if !has_class(element, class) {
                return false;
            }
        }

        for condition in &step.attrs {
            match condition {
                AttrCondition::Present(name) => {
                    if !element.attrs.contains_key(name) {
                        return false;
                    }
                }
                AttrCondition::Equals(name, expected) => {
                    if element.attrs.get(name) != Some(expected) {
                        return false;
                    }
                }
            }
        }

        true
    }

    fn collect_select_options(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        for child in &self.nodes[node_id.0].children {
            if self
                .tag_name(*child)
                .map(|tag| tag.eq_ignore_ascii_case("option"))
                .unwrap_or(false)
            {
                out.push(*child);
            }
            self.collect_select_options(*child, out);
        }
    }

    fn option_effective_value(&self, option_node: NodeId) -> Result<String> {
        let element = self
            .element(option_node)
            .ok_or_else(|| Error::Dom("option target is not an element".into()))?;
        if let Some(value) = element.attrs.get("value") {
            return Ok(value.clone());
        }
        Ok(self.text_content(option_node).trim().to_string())
    }

    fn set_select_value(&mut self, select_node: NodeId, requested: &str) -> Result<()> {
        let tag = self
            .tag_name(select_node)
            .ok_or_else(|| Error::Dom("select target is not an element".into()))?;
        if !tag.eq_ignore_ascii_case("select") {
            return Err(Error::Dom("set value target is not a select".into()));
        }

        let mut options = Vec::new();
        self.collect_select_options(select_node, &mut options);

        let mut option_values = Vec::with_capacity(options.len());
        for option in options {
            option_values.push((option, self.option_effective_value(option)?));
        }

        let matched = option_values
            .iter()
            .find(|(_, value)| value == requested)
            .map(|(node, value)| (*node, value.clone()));

        for (option, _) in &option_values {
            let option_element = self
                .element_mut(*option)
                .ok_or_else(|| Error::Dom("option target is not an element".into()))?;
            if Some(*option) == matched.as_ref().map(|(node, _)| *node) {
                option_element
                    .attrs
                    .insert("selected".to_string(), "true".to_string());
            } else {
                option_element.attrs.remove("selected");
            }
        }

        let element = self
            .element_mut(select_node)
            .ok_or_else(|| Error::Dom("select target is not an element".into()))?;
        element.value = matched.map(|(_, value)| value).unwrap_or_default();
        Ok(())
    }

    fn sync_select_value(&mut self, select_node: NodeId) -> Result<()> {
        let mut options = Vec::new();
        self.collect_select_options(select_node, &mut options);

        let mut selected = None;
        for option in &options {
            if self.has_attr(*option, "selected") {
                selected = Some(*option);
                break;
            }
        }
        let chosen = selected.or_else(|| options.first().copied());
        let value = match chosen {
            Some(option) => self.option_effective_value(option)?,
            None => String::new(),
        };

        let element = self
            .element_mut(select_node)
            .ok_or_else(|| Error::Dom("select target is not an element".into()))?;
        element.value = value;
        Ok(())
    }

    fn initialize_form_control_values(&mut self) -> Result<()> {
        let nodes = self.descendant_elements(self.root);
        for node in nodes {
            let is_textarea = self
                .tag_name(node)
                .map(|tag| tag.eq_ignore_ascii_case("textarea"))
                .unwrap_or(false);
            if is_textarea {
                let text = self.text_content(node);
                let element = self
                    .element_mut(node)
                    .ok_or_else(|| Error::Dom("textarea target is not an element".into()))?;
                element.value = text;
                continue;
            }

            let is_select = self
                .tag_name(node)
                .map(|tag| tag.eq_ignore_ascii_case("select"))
                .unwrap_or(false);
            if is_select {
                self.sync_select_value(node)?;
            }
        }
        Ok(())
    }

    fn dump_node(&self, node_id: NodeId) -> String {
        match &self.nodes[node_id.0].node_type {
            NodeType::Document => {
                let mut out = String::new();
                for child in &self.nodes[node_id.0].children {
                    out.push_str(&self.dump_node(*child));
                }
                out
            }
            NodeType::Text(text) => text.clone(),
            NodeType::Element(element) => {
                let mut out = String::new();
                out.push('<');
                out.push_str(&element.tag_name);
                let mut attrs: Vec<(&String, &String)> = element.attrs.iter().collect();
                attrs.sort_by(|a, b| a.0.cmp(b.0));
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(v);
                    out.push('"');
                }
                out.push('>');
                if is_void_tag(&element.tag_name) {
                    return out;
                }
                for child in &self.nodes[node_id.0].children {
                    out.push_str(&self.dump_node(*child));
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
                out
            }
        }
    }
}

fn has_class(element: &Element, class_name: &str) -> bool {
    element
        .attrs
        .get("class")
        .map(|classes| classes.split_whitespace().any(|c| c == class_name))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default)]
struct SelectorStep {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrCondition>,
}

#[derive(Debug, Clone)]
enum AttrCondition {
    Present(String),
    Equals(String, String),
}

fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorStep>>> {
    let mut groups = Vec::new();
    for group in split_selector_groups(selector)? {
        let mut steps = Vec::new();
        for token in tokenize_selector(&group)? {
            steps.push(parse_selector_step(&token)?);
        }
        if steps.is_empty() {
            return Err(Error::UnsupportedSelector(selector.to_string()));
        }
        groups.push(steps);
    }
    if groups.is_empty() {
        return Err(Error::UnsupportedSelector(selector.to_string()));
    }
    Ok(groups)
}

fn split_selector_groups(selector: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in selector.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '[' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' => {
                    if depth == 0 {
                        return Err(Error::UnsupportedSelector(selector.to_string()));
                    }
                    depth -= 1;
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    let trimmed = current.trim().to_string();
                    if trimmed.is_empty() {
                        return Err(Error::UnsupportedSelector(selector.to_string()));
                    }
                    out.push(trimmed);
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }

    if quote.is_some() || depth != 0 {
        return Err(Error::UnsupportedSelector(selector.to_string()));
    }

    let trimmed = current.trim().to_string();
    if trimmed.is_empty() {
        return Err(Error::UnsupportedSelector(selector.to_string()));
    }
    out.push(trimmed);
    Ok(out)
}

fn tokenize_selector(group: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in group.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '[' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' => {
                    if depth == 0 {
                        return Err(Error::UnsupportedSelector(group.to_string()));
                    }
                    depth -= 1;
                    current.push(ch);
                }
                c if c.is_whitespace() && depth == 0 => {
                    if !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(ch),
            },
        }
    }

    if quote.is_some() || depth != 0 {
        return Err(Error::UnsupportedSelector(group.to_string()));
    }
    if !current.is_empty() {
        out.push(current);
    }
    Ok(out)
}

fn parse_selector_step(token: &str) -> Result<SelectorStep> {
    let bytes = token.as_bytes();
    let mut step = SelectorStep::default();
    let mut i = 0usize;

    if bytes.is_empty() {
        return Err(Error::UnsupportedSelector(token.to_string()));
    }

    if bytes[0] == b'*' {
        i += 1;
    } else if is_selector_ident_char(bytes[0]) {
        let (ident, next) = parse_selector_ident(token, i)
            .ok_or_else(|| Error::UnsupportedSelector(token.to_string()))?;
        step.tag = Some(ident.to_ascii_lowercase());
        i = next;
    }

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                let (ident, next) = parse_selector_ident(token, i + 1)
                    .ok_or_else(|| Error::UnsupportedSelector(token.to_string()))?;
                step.id = Some(ident);
                i = next;
            }
            b'.' => {
                let (ident, next) = parse_selector_ident(token, i + 1)
                    .ok_or_else(|| Error::UnsupportedSelector(token.to_string()))?;
                step.classes.push(ident);
                i = next;
            }
            b'[' => {
                let (condition, next) = parse_selector_attr_condition(token, i)
                    .ok_or_else(|| Error::UnsupportedSelector(token.to_string()))?;
                step.attrs.push(condition);
                i = next;
            }
            _ => return Err(Error::UnsupportedSelector(token.to_string())),
        }
    }

    Ok(step)
}

fn parse_selector_ident(src: &str, start: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    let mut i = start;
    while i < bytes.len() && is_selector_ident_char(bytes[i]) {
        i += 1;
    }
    if i == start {
        return None;
    }
    Some((src.get(start..i)?.to_string(), i))
}

fn is_selector_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn parse_selector_attr_condition(src: &str, start: usize) -> Option<(AttrCondition, usize)> {
    let bytes = src.as_bytes();
    let mut i = start;
    if bytes.get(i) != Some(&b'[') {
        return None;
    }
    i += 1;

    let (name, next) = parse_selector_ident(src, i)?;
    i = next;
    let name = name.to_ascii_lowercase();

    match bytes.get(i) {
        Some(&b']') => Some((AttrCondition::Present(name), i + 1)),
        Some(&b'=') => {
            i += 1;
            let quote = bytes.get(i).copied()?;
            let value = if quote == b'"' || quote == b'\'' {
                i += 1;
                let value_start = i;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                if i >= bytes.len() {
                    return None;
                }
                let value = src.get(value_start..i)?.to_string();
                i += 1;
                value
            } else {
                let value_start = i;
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                src.get(value_start..i)?.to_string()
            };
            if bytes.get(i) != Some(&b']') {
                return None;
            }
            Some((AttrCondition::Equals(name, value), i + 1))
        }
        _ => None,
    }
}

fn is_form_control(dom: &Document, node_id: NodeId) -> bool {
    let Some(element) = dom.element(node_id) else {
        return false;
    };

    element.tag_name.eq_ignore_ascii_case("input")
        || element.tag_name.eq_ignore_ascii_case("select")
        || element.tag_name.eq_ignore_ascii_case("textarea")
        || element.tag_name.eq_ignore_ascii_case("button")
}

fn is_checkbox_input(dom: &Document, node_id: NodeId) -> bool {
    let Some(element) = dom.element(node_id) else {
        return false;
    };

    if !element.tag_name.eq_ignore_ascii_case("input") {
        return false;
    }

    element
        .attrs
        .get("type")
        .map(|kind| kind.eq_ignore_ascii_case("checkbox"))
        .unwrap_or(false)
}

fn is_radio_input(dom: &Document, node_id: NodeId) -> bool {
    let Some(element) = dom.element(node_id) else {
        return false;
    };

    if !element.tag_name.eq_ignore_ascii_case("input") {
        return false;
    }

    element
        .attrs
        .get("type")
        .map(|kind| kind.eq_ignore_ascii_case("radio"))
        .unwrap_or(false)
}

fn is_submit_control(dom: &Document, node_id: NodeId) -> bool {
    let Some(element) = dom.element(node_id) else {
        return false;
    };

    if element.tag_name.eq_ignore_ascii_case("button") {
        return element
            .attrs
            .get("type")
            .map(|kind| kind.eq_ignore_ascii_case("submit"))
            .unwrap_or(true);
    }

    if element.tag_name.eq_ignore_ascii_case("input") {
        return element
            .attrs
            .get("type")
            .map(|kind| kind.eq_ignore_ascii_case("submit") || kind.eq_ignore_ascii_case("image"))
            .unwrap_or(false);
    }

    false
}

fn is_index_bearing_attr(name: &str) -> bool {
    name == "id" || name == "name" || name == "for" || name.starts_with("data-")
}

#[derive(Debug, Clone)]
struct IndexPattern {
    baseline: u64,
    matcher: Regex,
}

impl IndexPattern {
    fn for_baseline(baseline: u64) -> Result<Self> {
        // The baseline digits only count as an index when bracketed, delimited,
        // or standing alone as the whole attribute value.
        let pattern = format!(
            r"(?<=\[){0}(?=\])|(?<=[-_]){0}(?=$|[\[.\-_])|^{0}$",
            baseline
        );
        let matcher = Regex::new(&pattern).map_err(|err| Error::IndexPattern(err.to_string()))?;
        Ok(Self { baseline, matcher })
    }

    fn rewrite(&self, value: &str, index: u64) -> Result<String> {
        let replacement = index.to_string();
        let mut out = String::new();
        let mut last = 0usize;
        for found in self.matcher.find_iter(value) {
            let matched = found.map_err(|err| Error::IndexPattern(err.to_string()))?;
            out.push_str(&value[last..matched.start()]);
            out.push_str(&replacement);
            last = matched.end();
        }
        out.push_str(&value[last..]);
        Ok(out)
    }
}

fn detect_baseline(template: &Document, root: NodeId) -> Result<Option<u64>> {
    let detector = Regex::new(r"\[(\d+)\]|[-_](\d+)(?=$|[\[.\-_])|^(\d+)$")
        .map_err(|err| Error::IndexPattern(err.to_string()))?;

    let mut nodes = vec![root];
    nodes.extend(template.descendant_elements(root));
    for node in nodes {
        let Some(element) = template.element(node) else {
            continue;
        };
        for name in index_bearing_attr_names(element) {
            let Some(value) = element.attrs.get(&name) else {
                continue;
            };
            let captures = detector
                .captures(value)
                .map_err(|err| Error::IndexPattern(err.to_string()))?;
            let Some(captures) = captures else {
                continue;
            };
            for group in 1..=3 {
                if let Some(digits) = captures.get(group) {
                    let parsed = digits
                        .as_str()
                        .parse::<u64>()
                        .map_err(|err| Error::IndexPattern(err.to_string()))?;
                    return Ok(Some(parsed));
                }
            }
        }
    }
    Ok(None)
}

// Deterministic scan order: well-known attributes first, then data-* sorted.
fn index_bearing_attr_names(element: &Element) -> Vec<String> {
    let mut names = Vec::new();
    for known in ["id", "name", "for"] {
        if element.attrs.contains_key(known) {
            names.push(known.to_string());
        }
    }
    let mut data_names: Vec<String> = element
        .attrs
        .keys()
        .filter(|name| name.starts_with("data-"))
        .cloned()
        .collect();
    data_names.sort();
    names.extend(data_names);
    names
}

fn rewrite_indices(
    dom: &mut Document,
    root: NodeId,
    pattern: &IndexPattern,
    index: u64,
) -> Result<()> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let rewrites = {
            let mut rewrites = Vec::new();
            if let Some(element) = dom.element(node) {
                for (name, value) in &element.attrs {
                    if !is_index_bearing_attr(name) {
                        continue;
                    }
                    let rewritten = pattern.rewrite(value, index)?;
                    if rewritten != *value {
                        rewrites.push((name.clone(), rewritten));
                    }
                }
            }
            rewrites
        };
        for (name, value) in rewrites {
            dom.set_attr(node, &name, &value)?;
        }
        for child in dom.nodes[node.0].children.iter().rev() {
            stack.push(*child);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormRequest {
    pub path: String,
    pub fields: Vec<(String, String)>,
}

impl FormRequest {
    pub fn encoded_body(&self) -> String {
        form_urlencode(&self.fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
}

impl TransportResponse {
    pub fn new(status: u16, status_text: &str) -> Self {
        Self {
            status,
            status_text: status_text.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}

impl StdError for TransportError {}

pub trait Transport {
    fn send(
        &mut self,
        request: &FormRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct FixedResponseTransport {
    status: u16,
    status_text: String,
}

impl FixedResponseTransport {
    pub fn new(status: u16, status_text: &str) -> Self {
        Self {
            status,
            status_text: status_text.to_string(),
        }
    }
}

impl Transport for FixedResponseTransport {
    fn send(
        &mut self,
        _request: &FormRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(self.status, &self.status_text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { status: u16 },
    Rejected { status: u16 },
    UnexpectedStatus { status: u16, status_text: String },
    TransportFailed { message: String },
}

impl SubmitOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Accepted { .. })
    }
}

pub trait FailureReporter {
    fn report_failure(&mut self, outcome: &SubmitOutcome);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report_failure(&mut self, outcome: &SubmitOutcome) {
        match outcome {
            SubmitOutcome::Rejected { status } => {
                tracing::warn!(status = *status, "form submission rejected by validation");
            }
            SubmitOutcome::UnexpectedStatus {
                status,
                status_text,
            } => {
                tracing::error!(
                    status = *status,
                    status_text = %status_text,
                    "form submission failed with unexpected status"
                );
            }
            SubmitOutcome::TransportFailed { message } => {
                tracing::error!(message = %message, "form submission transport failed");
            }
            SubmitOutcome::Accepted { .. } => {}
        }
    }
}

fn form_urlencode(fields: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        push_urlencoded(&mut out, name);
        out.push('=');
        push_urlencoded(&mut out, value);
    }
    out
}

fn push_urlencoded(out: &mut String, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBuilderConfig {
    pub container: String,
    pub group_marker: String,
    pub trigger: String,
}

impl RowBuilderConfig {
    pub fn new(container: &str, group_marker: &str, trigger: &str) -> Self {
        Self {
            container: container.to_string(),
            group_marker: group_marker.to_string(),
            trigger: trigger.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionToggleConfig {
    pub checkbox: String,
    pub section: String,
}

impl SectionToggleConfig {
    pub fn new(checkbox: &str, section: &str) -> Self {
        Self {
            checkbox: checkbox.to_string(),
            section: section.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitGuardConfig {
    pub form: String,
    pub endpoint: String,
}

impl SubmitGuardConfig {
    pub fn new(form: &str, endpoint: &str) -> Self {
        Self {
            form: form.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    AddRow { builder: usize },
    ToggleSection { toggle: usize },
    SubmitForm { guard: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    action: Action,
}

#[derive(Debug, Default, Clone)]
struct BindingStore {
    map: HashMap<NodeId, HashMap<String, Vec<Binding>>>,
}

impl BindingStore {
    fn add(&mut self, node_id: NodeId, event: String, binding: Binding) {
        self.map
            .entry(node_id)
            .or_default()
            .entry(event)
            .or_default()
            .push(binding);
    }

    fn remove(&mut self, node_id: NodeId, event: &str, action: Action) -> bool {
        let Some(events) = self.map.get_mut(&node_id) else {
            return false;
        };
        let Some(bindings) = events.get_mut(event) else {
            return false;
        };

        if let Some(pos) = bindings.iter().position(|binding| binding.action == action) {
            bindings.remove(pos);
            if bindings.is_empty() {
                events.remove(event);
            }
            if events.is_empty() {
                self.map.remove(&node_id);
            }
            return true;
        }

        false
    }

    fn get(&self, node_id: NodeId, event: &str) -> Vec<Binding> {
        self.map
            .get(&node_id)
            .and_then(|events| events.get(event))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct EventState {
    event_type: String,
    default_prevented: bool,
}

impl EventState {
    fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            default_prevented: false,
        }
    }
}

#[derive(Debug)]
struct RowBuilder {
    container: NodeId,
    group_marker: String,
    template: Document,
    pattern: IndexPattern,
    counter: u64,
}

#[derive(Debug)]
struct SectionToggle {
    section: NodeId,
}

struct SubmitGuard {
    form: NodeId,
    endpoint: String,
    transport: Box<dyn Transport>,
    reporter: Box<dyn FailureReporter>,
}

impl std::fmt::Debug for SubmitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitGuard")
            .field("form", &self.form)
            .field("endpoint", &self.endpoint)
            .field("transport", &format_args!("<dyn Transport>"))
            .field("reporter", &format_args!("<dyn FailureReporter>"))
            .finish()
    }
}

#[derive(Debug)]
pub struct FormPage {
    dom: Document,
    bindings: BindingStore,
    builders: Vec<RowBuilder>,
    toggles: Vec<SectionToggle>,
    guards: Vec<SubmitGuard>,
    outcomes: Vec<SubmitOutcome>,
}

impl FormPage {
    pub fn from_html(html: &str) -> Result<Self> {
        let dom = parse_html(html)?;
        Ok(Self {
            dom,
            bindings: BindingStore::default(),
            builders: Vec::new(),
            toggles: Vec::new(),
            guards: Vec::new(),
            outcomes: Vec::new(),
        })
    }

    pub fn install_row_builder(&mut self, config: &RowBuilderConfig) -> Result<bool> {
        let Some(container) = self.dom.query_selector(&config.container)? else {
            return Ok(false);
        };
        let groups = self
            .dom
            .query_selector_all_from(container, &config.group_marker)?;
        let Some(template_node) = groups.first().copied() else {
            return Ok(false);
        };
        let Some(trigger) = self.dom.query_selector_from(container, &config.trigger)? else {
            return Ok(false);
        };

        let mut template = Document::new();
        let template_root = template.clone_subtree_from(&self.dom, template_node, None)?;
        template.append_child(template.root, template_root)?;

        let baseline = detect_baseline(&template, template_root)?.unwrap_or(0);
        let pattern = IndexPattern::for_baseline(baseline)?;

        self.builders.push(RowBuilder {
            container,
            group_marker: config.group_marker.clone(),
            template,
            pattern,
            counter: 0,
        });
        self.bindings.add(
            trigger,
            "click".to_string(),
            Binding {
                action: Action::AddRow {
                    builder: self.builders.len() - 1,
                },
            },
        );
        Ok(true)
    }

    pub fn install_section_toggle(&mut self, config: &SectionToggleConfig) -> Result<bool> {
        let Some(checkbox) = self.dom.query_selector(&config.checkbox)? else {
            return Ok(false);
        };
        let Some(section) = self.dom.query_selector(&config.section)? else {
            return Ok(false);
        };
        if !is_checkbox_input(&self.dom, checkbox) {
            return Ok(false);
        }

        self.toggles.push(SectionToggle { section });
        self.bindings.add(
            checkbox,
            "change".to_string(),
            Binding {
                action: Action::ToggleSection {
                    toggle: self.toggles.len() - 1,
                },
            },
        );
        Ok(true)
    }

    pub fn install_submit_guard(
        &mut self,
        config: &SubmitGuardConfig,
        transport: Box<dyn Transport>,
        reporter: Box<dyn FailureReporter>,
    ) -> Result<bool> {
        let Some(form) = self.dom.query_selector(&config.form)? else {
            return Ok(false);
        };
        if !self
            .dom
            .tag_name(form)
            .map(|tag| tag.eq_ignore_ascii_case("form"))
            .unwrap_or(false)
        {
            return Ok(false);
        }

        self.guards.push(SubmitGuard {
            form,
            endpoint: config.endpoint.clone(),
            transport,
            reporter,
        });
        self.bindings.add(
            form,
            "submit".to_string(),
            Binding {
                action: Action::SubmitForm {
                    guard: self.guards.len() - 1,
                },
            },
        );
        Ok(true)
    }

    pub fn click(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }

        let click_outcome = self.dispatch_event(target, "click")?;
        if click_outcome.default_prevented {
            return Ok(());
        }

        if is_checkbox_input(&self.dom, target) {
            let current = self.dom.checked(target);
            self.dom.set_checked(target, !current)?;
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        }

        if is_radio_input(&self.dom, target) {
            let current = self.dom.checked(target);
            if !current {
                self.uncheck_other_radios_in_group(target)?;
                self.dom.set_checked(target, true)?;
                self.dispatch_event(target, "input")?;
                self.dispatch_event(target, "change")?;
            }
        }

        if is_submit_control(&self.dom, target) {
            if let Some(form_id) = self.dom.find_ancestor_by_tag(target, "form") {
                self.dispatch_event(form_id, "submit")?;
            }
        }

        Ok(())
    }

    pub fn set_checked(&mut self, selector: &str, checked: bool) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        let tag = self
            .dom
            .tag_name(target)
            .map(|tag| tag.to_ascii_lowercase())
            .unwrap_or_default();
        if tag != "input" {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input[type=checkbox|radio]".into(),
                actual: tag,
            });
        }

        let kind = self
            .dom
            .attr(target, "type")
            .unwrap_or_else(|| "text".into())
            .to_ascii_lowercase();
        if kind != "checkbox" && kind != "radio" {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input[type=checkbox|radio]".into(),
                actual: format!("input[type={kind}]"),
            });
        }

        let current = self.dom.checked(target);
        if current != checked {
            if kind == "radio" && checked {
                self.uncheck_other_radios_in_group(target)?;
            }
            self.dom.set_checked(target, checked)?;
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        }

        Ok(())
    }

    pub fn set_value(&mut self, selector: &str, value: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        let tag = self
            .dom
            .tag_name(target)
            .map(|tag| tag.to_ascii_lowercase())
            .unwrap_or_default();
        if !matches!(tag.as_str(), "input" | "select" | "textarea") {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input|select|textarea".into(),
                actual: tag,
            });
        }

        let current = self.dom.value(target)?;
        if current != value {
            self.dom.set_value(target, value)?;
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        }

        Ok(())
    }

    pub fn submit(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;

        let form = if self
            .dom
            .tag_name(target)
            .map(|tag| tag.eq_ignore_ascii_case("form"))
            .unwrap_or(false)
        {
            Some(target)
        } else {
            self.dom.find_ancestor_by_tag(target, "form")
        };

        if let Some(form_id) = form {
            self.dispatch_event(form_id, "submit")?;
        }

        Ok(())
    }

    pub fn dispatch(&mut self, selector: &str, event: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.dispatch_event(target, event)?;
        Ok(())
    }

    pub fn text(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.dom.text_content(target))
    }

    pub fn value(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        self.dom.value(target)
    }

    pub fn attr(&self, selector: &str, name: &str) -> Result<Option<String>> {
        let target = self.select_one(selector)?;
        Ok(self.dom.attr(target, name))
    }

    pub fn checked(&self, selector: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        Ok(self.dom.checked(target))
    }

    pub fn disabled(&self, selector: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        Ok(self.dom.disabled(target))
    }

    pub fn exists(&self, selector: &str) -> bool {
        matches!(self.dom.query_selector(selector), Ok(Some(_)))
    }

    pub fn count(&self, selector: &str) -> Result<usize> {
        Ok(self.dom.query_selector_all(selector)?.len())
    }

    pub fn dump(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.dom.dump_node(target))
    }

    pub fn dump_document(&self) -> String {
        self.dom.dump_node(self.dom.root)
    }

    pub fn take_submit_outcomes(&mut self) -> Vec<SubmitOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    fn select_one(&self, selector: &str) -> Result<NodeId> {
        if let Some(id) = selector.strip_prefix('#') {
            if is_plain_ident(id) {
                return self
                    .dom
                    .by_id(id)
                    .ok_or_else(|| Error::SelectorNotFound(selector.to_string()));
            }
        }
        self.dom
            .query_selector(selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))
    }

    fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> Result<EventState> {
        let mut event = EventState::new(event_type);

        // Bubble from the target up through its ancestors.
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(node) = cursor {
            path.push(node);
            cursor = self.dom.parent(node);
        }

        for node in path {
            for binding in self.bindings.get(node, &event.event_type) {
                self.run_action(binding.action, &mut event)?;
            }
        }

        Ok(event)
    }

    fn run_action(&mut self, action: Action, event: &mut EventState) -> Result<()> {
        match action {
            Action::AddRow { builder } => self.run_add_row(builder),
            Action::ToggleSection { toggle } => self.run_toggle(toggle),
            Action::SubmitForm { guard } => {
                event.default_prevented = true;
                self.run_submit(guard)
            }
        }
    }

    fn run_add_row(&mut self, builder: usize) -> Result<()> {
        self.builders[builder].counter += 1;
        let (container, index, marker) = {
            let state = &self.builders[builder];
            (
                state.container,
                state.pattern.baseline + state.counter,
                state.group_marker.clone(),
            )
        };

        let template_root = self.builders[builder]
            .template
            .first_element_child(self.builders[builder].template.root)
            .ok_or_else(|| Error::Dom("row template is empty".into()))?;
        let clone =
            self.dom
                .clone_subtree_from(&self.builders[builder].template, template_root, None)?;
        rewrite_indices(&mut self.dom, clone, &self.builders[builder].pattern, index)?;

        let groups = self.dom.query_selector_all_from(container, &marker)?;
        match groups.last().copied() {
            Some(last) => self.dom.insert_after(last, clone)?,
            None => self.dom.append_child(container, clone)?,
        }
        self.dom.rebuild_id_index();

        tracing::debug!(index, "row group appended");
        Ok(())
    }

    fn run_toggle(&mut self, toggle: usize) -> Result<()> {
        let section = self.toggles[toggle].section;

        if self.dom.has_attr(section, "hidden") {
            self.dom.remove_attr(section, "hidden")?;
        } else {
            self.dom.set_attr(section, "hidden", "true")?;
        }

        let controls: Vec<NodeId> = self
            .dom
            .descendant_elements(section)
            .into_iter()
            .filter(|node| is_form_control(&self.dom, *node))
            .collect();
        for control in controls {
            let disabled = self.dom.disabled(control);
            self.dom.set_disabled(control, !disabled)?;
        }

        Ok(())
    }

    fn run_submit(&mut self, guard: usize) -> Result<()> {
        let form = self.guards[guard].form;

        // One submission in flight: the binding comes off before anything else.
        self.bindings
            .remove(form, "submit", Action::SubmitForm { guard });

        let controls: Vec<NodeId> = self
            .dom
            .descendant_elements(form)
            .into_iter()
            .filter(|node| is_form_control(&self.dom, *node))
            .collect();
        let enabled: Vec<NodeId> = controls
            .iter()
            .copied()
            .filter(|node| !self.dom.disabled(*node))
            .collect();
        for control in &controls {
            self.dom.set_disabled(*control, true)?;
        }

        let fields = self.serialize_form(form);
        let request = FormRequest {
            path: self.guards[guard].endpoint.clone(),
            fields,
        };
        tracing::debug!(
            path = %request.path,
            fields = request.fields.len(),
            "submitting form"
        );

        let sent = self.guards[guard].transport.send(&request);
        let outcome = match sent {
            Ok(response) if response.is_success() => SubmitOutcome::Accepted {
                status: response.status,
            },
            Ok(response) if response.status == 422 => SubmitOutcome::Rejected {
                status: response.status,
            },
            Ok(response) => SubmitOutcome::UnexpectedStatus {
                status: response.status,
                status_text: response.status_text,
            },
            Err(error) => SubmitOutcome::TransportFailed {
                message: error.message,
            },
        };

        match &outcome {
            SubmitOutcome::Accepted { status } => {
                tracing::info!(status = *status, "form submission accepted");
            }
            failure => {
                self.guards[guard].reporter.report_failure(failure);
                // Recovery: give the controls back and re-arm the guard.
                for control in enabled {
                    self.dom.set_disabled(control, false)?;
                }
                self.bindings.add(
                    form,
                    "submit".to_string(),
                    Binding {
                        action: Action::SubmitForm { guard },
                    },
                );
            }
        }

        self.outcomes.push(outcome);
        Ok(())
    }

    fn serialize_form(&self, form: NodeId) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        for node in self.dom.descendant_elements(form) {
            let Some(element) = self.dom.element(node) else {
                continue;
            };
            let Some(name) = element.attrs.get("name") else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            let tag = element.tag_name.to_ascii_lowercase();
            match tag.as_str() {
                "input" => {
                    let kind = element
                        .attrs
                        .get("type")
                        .map(|kind| kind.to_ascii_lowercase())
                        .unwrap_or_else(|| "text".to_string());
                    match kind.as_str() {
                        "checkbox" | "radio" => {
                            if element.checked {
                                let value = if element.value.is_empty() {
                                    "on".to_string()
                                } else {
                                    element.value.clone()
                                };
                                fields.push((name.clone(), value));
                            }
                        }
                        "submit" | "button" | "image" | "reset" | "file" => {}
                        _ => fields.push((name.clone(), element.value.clone())),
                    }
                }
                "select" | "textarea" => {
                    fields.push((name.clone(), element.value.clone()));
                }
                _ => {}
            }
        }
        fields
    }

    fn uncheck_other_radios_in_group(&mut self, target: NodeId) -> Result<()> {
        let Some(name) = self.dom.attr(target, "name") else {
            return Ok(());
        };
        if name.is_empty() {
            return Ok(());
        }

        let scope = self
            .dom
            .find_ancestor_by_tag(target, "form")
            .unwrap_or(self.dom.root);
        let radios: Vec<NodeId> = self
            .dom
            .descendant_elements(scope)
            .into_iter()
            .filter(|node| {
                *node != target
                    && is_radio_input(&self.dom, *node)
                    && self.dom.attr(*node, "name").as_deref() == Some(name.as_str())
            })
            .collect();
        for radio in radios {
            self.dom.set_checked(radio, false)?;
        }
        Ok(())
    }
}

fn is_plain_ident(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(is_selector_ident_char)
}

/// A start tag as scanned from the markup, before it lands in the tree.
struct StartTag {
    name: String,
    attrs: HashMap<String, String>,
    self_closing: bool,
}

/// Byte cursor over raw markup. Comments, tags, and text runs are consumed
/// in document order; the open-element stack stays with the caller.
struct MarkupCursor<'a> {
    html: &'a str,
    pos: usize,
}

impl<'a> MarkupCursor<'a> {
    fn new(html: &'a str) -> Self {
        Self { html, pos: 0 }
    }

    fn bytes(&self) -> &'a [u8] {
        self.html.as_bytes()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.html.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes().get(self.pos).copied()
    }

    fn looking_at(&self, token: &str) -> bool {
        self.bytes()[self.pos..].starts_with(token.as_bytes())
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, keep: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&keep) {
            self.pos += 1;
        }
        &self.html[start..self.pos]
    }

    /// Consumes `<!-- ... -->`; the cursor sits on the opening `<!--`.
    fn skip_comment(&mut self) -> Result<()> {
        let bytes = self.bytes();
        let mut i = self.pos + 4;
        while i + 3 <= bytes.len() {
            if &bytes[i..i + 3] == b"-->" {
                self.pos = i + 3;
                return Ok(());
            }
            i += 1;
        }
        Err(Error::HtmlParse("unclosed HTML comment".into()))
    }

    /// Consumes `<!doctype ...>` and any other `<!` declaration.
    fn skip_declaration(&mut self) {
        while let Some(b) = self.peek() {
            self.pos += 1;
            if b == b'>' {
                return;
            }
        }
    }

    fn read_start_tag(&mut self) -> Result<StartTag> {
        self.pos += 1;
        self.skip_whitespace();
        let name = self.take_while(is_tag_char).to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::HtmlParse("empty tag name".into()));
        }

        let mut tag = StartTag {
            name,
            attrs: HashMap::new(),
            self_closing: false,
        };

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Error::HtmlParse("unclosed start tag".into())),
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') if self.looking_at("/>") => {
                    tag.self_closing = true;
                    self.pos += 2;
                    break;
                }
                Some(_) => {
                    let attr = self.take_while(is_attr_name_char).to_ascii_lowercase();
                    if attr.is_empty() {
                        return Err(Error::HtmlParse("invalid attribute name".into()));
                    }
                    self.skip_whitespace();
                    let value = if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.skip_whitespace();
                        self.read_attr_value()?
                    } else {
                        // Bare attributes carry "true", the same shape the
                        // checked and disabled flags are parsed from.
                        "true".to_string()
                    };
                    tag.attrs.insert(attr, value);
                }
            }
        }

        Ok(tag)
    }

    fn read_attr_value(&mut self) -> Result<String> {
        let Some(first) = self.peek() else {
            return Err(Error::HtmlParse("unterminated attribute".into()));
        };

        if first == b'"' || first == b'\'' {
            self.pos += 1;
            let value = self.take_while(|b| b != first).to_string();
            if self.at_end() {
                return Err(Error::HtmlParse("unterminated attribute value".into()));
            }
            self.pos += 1;
            return Ok(value);
        }

        Ok(self
            .take_while(|b| !b.is_ascii_whitespace() && b != b'>')
            .to_string())
    }

    fn read_end_tag(&mut self) -> Result<String> {
        self.pos += 2;
        self.skip_whitespace();
        let name = self.take_while(is_tag_char).to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::HtmlParse("empty end tag".into()));
        }
        self.skip_whitespace();
        if self.peek() != Some(b'>') {
            return Err(Error::HtmlParse("unclosed end tag".into()));
        }
        self.pos += 1;
        Ok(name)
    }

    fn read_text_run(&mut self) -> &'a str {
        self.take_while(|b| b != b'<')
    }

    /// Skips a raw-text body (`<script>`, `<style>`) through its end tag.
    /// The body itself is discarded, not modeled.
    fn skip_raw_text(&mut self, tag: &str) -> Result<()> {
        let bytes = self.bytes();
        let needle = tag.as_bytes();
        let mut i = self.pos;
        while i + needle.len() + 2 <= bytes.len() {
            if bytes[i] == b'<'
                && bytes[i + 1] == b'/'
                && bytes[i + 2..i + 2 + needle.len()].eq_ignore_ascii_case(needle)
            {
                self.pos = i;
                self.read_end_tag()?;
                return Ok(());
            }
            i += 1;
        }
        Err(Error::HtmlParse(format!("unclosed <{tag}>")))
    }
}

fn parse_html(html: &str) -> Result<Document> {
    let mut dom = Document::new();
    let mut open = vec![dom.root];
    let mut cursor = MarkupCursor::new(html);

    while !cursor.at_end() {
        if cursor.looking_at("<!--") {
            cursor.skip_comment()?;
            continue;
        }

        if cursor.looking_at("<!") {
            cursor.skip_declaration();
            continue;
        }

        if cursor.looking_at("</") {
            let tag = cursor.read_end_tag()?;
            // Mismatched end tags recover by popping to the nearest open
            // element with the same name.
            while open.len() > 1 {
                let Some(top) = open.pop() else {
                    break;
                };
                if dom
                    .tag_name(top)
                    .is_some_and(|name| name.eq_ignore_ascii_case(&tag))
                {
                    break;
                }
            }
            continue;
        }

        if cursor.peek() == Some(b'<') {
            let tag = cursor.read_start_tag()?;
            let parent = *open
                .last()
                .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
            let node = dom.create_element(parent, tag.name.clone(), tag.attrs);

            if tag.name == "script" || tag.name == "style" {
                cursor.skip_raw_text(&tag.name)?;
                continue;
            }
            if !tag.self_closing && !is_void_tag(&tag.name) {
                open.push(node);
            }
            continue;
        }

        let text = cursor.read_text_run();
        if !text.is_empty() {
            let parent = *open
                .last()
                .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
            dom.create_text(parent, text.to_string());
        }
    }

    dom.initialize_form_control_values()?;
    Ok(dom)
}

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

fn is_void_tag(tag: &str) -> bool {
    VOID_TAGS.contains(&tag)
}

fn is_tag_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

fn is_attr_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':'
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const MERGE_FORM_HTML: &str = r##"
    <form id="merge-tags-form">
      <div class="merge-item" id="merge-item-0">
        <select name="merge[0][tag]">
          <option value="FNAME">First name</option>
          <option value="LNAME">Last name</option>
        </select>
        <input name="merge[0][value]" value="">
      </div>
      <a id="add-merge-item" href="#">Add another merge tag</a>
      <button type="submit">Validate</button>
    </form>
    "##;

    fn merge_builder_config() -> RowBuilderConfig {
        RowBuilderConfig::new("#merge-tags-form", ".merge-item", "#add-merge-item")
    }

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Rc<RefCell<Vec<FormRequest>>>,
        responses: Rc<RefCell<Vec<std::result::Result<TransportResponse, TransportError>>>>,
    }

    impl RecordingTransport {
        fn respond_with(
            responses: Vec<std::result::Result<TransportResponse, TransportError>>,
        ) -> Self {
            Self {
                sent: Rc::new(RefCell::new(Vec::new())),
                responses: Rc::new(RefCell::new(responses)),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send(
            &mut self,
            request: &FormRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            self.sent.borrow_mut().push(request.clone());
            if self.responses.borrow().is_empty() {
                return Ok(TransportResponse::new(200, "OK"));
            }
            self.responses.borrow_mut().remove(0)
        }
    }

    #[derive(Clone, Default)]
    struct CollectingReporter {
        failures: Rc<RefCell<Vec<SubmitOutcome>>>,
    }

    impl FailureReporter for CollectingReporter {
        fn report_failure(&mut self, outcome: &SubmitOutcome) {
            self.failures.borrow_mut().push(outcome.clone());
        }
    }

    #[test]
    fn add_row_appends_groups_with_increasing_indices() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        assert!(page.install_row_builder(&merge_builder_config())?);

        page.click("#add-merge-item")?;
        page.click("#add-merge-item")?;

        assert_eq!(page.count("#merge-tags-form .merge-item")?, 3);
        assert!(page.exists("[name=\"merge[1][value]\"]"));
        assert!(page.exists("[name=\"merge[2][value]\"]"));
        assert!(page.exists("[name=\"merge[1][tag]\"]"));
        Ok(())
    }

    #[test]
    fn added_rows_land_after_the_last_group() -> Result<()> {
        let html = r##"
        <form id="order-form">
          <div class="row" id="row-0">
            <input name="rows[0][qty]" value="1">
          </div>
          <a id="add-row" href="#">more</a>
        </form>
        "##;
        let mut page = FormPage::from_html(html)?;
        assert!(page.install_row_builder(&RowBuilderConfig::new(
            "#order-form",
            ".row",
            "#add-row"
        ))?);

        page.click("#add-row")?;
        assert!(page.exists("#row-1"));
        assert!(page.exists("[name=\"rows[1][qty]\"]"));

        page.click("#add-row")?;
        assert!(page.exists("#row-2"));
        assert!(page.exists("[name=\"rows[2][qty]\"]"));

        let dump = page.dump("#order-form")?;
        let first = dump.find("id=\"row-0\"").expect("row-0 missing");
        let second = dump.find("id=\"row-1\"").expect("row-1 missing");
        let third = dump.find("id=\"row-2\"").expect("row-2 missing");
        assert!(first < second && second < third);
        Ok(())
    }

    #[test]
    fn missing_container_is_inert() -> Result<()> {
        let mut page = FormPage::from_html("<p id=\"nothing\">no form here</p>")?;
        let before = page.dump_document();
        assert!(!page.install_row_builder(&merge_builder_config())?);
        assert_eq!(page.dump_document(), before);
        Ok(())
    }

    #[test]
    fn missing_template_group_is_inert() -> Result<()> {
        let html = r##"
        <form id="merge-tags-form">
          <a id="add-merge-item" href="#">add</a>
        </form>
        "##;
        let mut page = FormPage::from_html(html)?;
        assert!(!page.install_row_builder(&merge_builder_config())?);

        // The trigger stays unbound.
        page.click("#add-merge-item")?;
        assert_eq!(page.count(".merge-item")?, 0);
        Ok(())
    }

    #[test]
    fn missing_trigger_is_inert() -> Result<()> {
        let html = r#"
        <form id="merge-tags-form">
          <div class="merge-item"><input name="merge[0][value]"></div>
        </form>
        "#;
        let mut page = FormPage::from_html(html)?;
        assert!(!page.install_row_builder(&merge_builder_config())?);
        assert_eq!(page.count(".merge-item")?, 1);
        Ok(())
    }

    #[test]
    fn substitution_is_scoped_to_index_bearing_attributes() -> Result<()> {
        let html = r##"
        <form id="merge-tags-form">
          <div class="merge-item" id="merge-item-0">
            <input name="merge[0][value]" placeholder="0 or more tags" value="">
            <span>0 results</span>
          </div>
          <a id="add-merge-item" href="#">add</a>
        </form>
        "##;
        let mut page = FormPage::from_html(html)?;
        assert!(page.install_row_builder(&merge_builder_config())?);

        page.click("#add-merge-item")?;

        let added = page.dump("#merge-item-1")?;
        assert!(added.contains("merge[1][value]"));
        assert!(added.contains("placeholder=\"0 or more tags\""));
        assert!(added.contains("0 results"));
        Ok(())
    }

    #[test]
    fn baseline_above_zero_keeps_counting_from_it() -> Result<()> {
        let html = r##"
        <form id="merge-tags-form">
          <div class="merge-item"><input name="merge[3][value]"></div>
          <a id="add-merge-item" href="#">add</a>
        </form>
        "##;
        let mut page = FormPage::from_html(html)?;
        assert!(page.install_row_builder(&merge_builder_config())?);

        page.click("#add-merge-item")?;
        assert!(page.exists("[name=\"merge[4][value]\"]"));

        page.click("#add-merge-item")?;
        assert!(page.exists("[name=\"merge[5][value]\"]"));
        Ok(())
    }

    #[test]
    fn earlier_rows_survive_later_additions() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        assert!(page.install_row_builder(&merge_builder_config())?);

        page.click("#add-merge-item")?;
        page.set_value("[name=\"merge[1][value]\"]", "Pat")?;
        page.click("#add-merge-item")?;

        assert_eq!(page.value("[name=\"merge[1][value]\"]")?, "Pat");
        assert_eq!(page.value("[name=\"merge[2][value]\"]")?, "");
        Ok(())
    }

    #[test]
    fn template_is_captured_at_install_time() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        assert!(page.install_row_builder(&merge_builder_config())?);

        // Edits to the live template group do not leak into later clones.
        page.set_value("[name=\"merge[0][value]\"]", "edited")?;
        page.click("#add-merge-item")?;

        assert_eq!(page.value("[name=\"merge[1][value]\"]")?, "");
        Ok(())
    }

    #[test]
    fn section_toggle_flips_hidden_and_disabled() -> Result<()> {
        let html = r#"
        <form id="interest-groups-form">
          <input id="analyze-whole-list" type="checkbox">
          <div id="interest-groups">
            <select name="group"><option value="a">A</option></select>
            <input name="threshold" value="5">
          </div>
        </form>
        "#;
        let mut page = FormPage::from_html(html)?;
        assert!(page.install_section_toggle(&SectionToggleConfig::new(
            "#analyze-whole-list",
            "#interest-groups"
        ))?);

        page.click("#analyze-whole-list")?;
        assert_eq!(
            page.attr("#interest-groups", "hidden")?,
            Some("true".to_string())
        );
        assert!(page.disabled("[name=\"group\"]")?);
        assert!(page.disabled("[name=\"threshold\"]")?);

        page.click("#analyze-whole-list")?;
        assert_eq!(page.attr("#interest-groups", "hidden")?, None);
        assert!(!page.disabled("[name=\"group\"]")?);
        assert!(!page.disabled("[name=\"threshold\"]")?);
        Ok(())
    }

    #[test]
    fn section_toggle_requires_a_checkbox() -> Result<()> {
        let html = r#"
        <form>
          <input id="not-a-checkbox" type="text">
          <div id="section"><input name="x"></div>
        </form>
        "#;
        let mut page = FormPage::from_html(html)?;
        assert!(!page.install_section_toggle(&SectionToggleConfig::new(
            "#not-a-checkbox",
            "#section"
        ))?);
        Ok(())
    }

    #[test]
    fn accepted_submission_disables_the_form_for_good() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        let transport =
            RecordingTransport::respond_with(vec![Ok(TransportResponse::new(200, "OK"))]);
        let sent = transport.sent.clone();
        assert!(page.install_submit_guard(
            &SubmitGuardConfig::new("#merge-tags-form", "/validate-merge-tags"),
            Box::new(transport),
            Box::new(TracingReporter),
        )?);

        page.submit("#merge-tags-form")?;
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(sent.borrow()[0].path, "/validate-merge-tags");
        assert!(page.disabled("[name=\"merge[0][value]\"]")?);

        // The guard unbound itself, so a second submit goes nowhere.
        page.submit("#merge-tags-form")?;
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(
            page.take_submit_outcomes(),
            vec![SubmitOutcome::Accepted { status: 200 }]
        );
        Ok(())
    }

    #[test]
    fn rejected_submission_reenables_and_rearms() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        let transport = RecordingTransport::respond_with(vec![
            Ok(TransportResponse::new(422, "Unprocessable Entity")),
            Ok(TransportResponse::new(200, "OK")),
        ]);
        let sent = transport.sent.clone();
        let reporter = CollectingReporter::default();
        let failures = reporter.failures.clone();
        assert!(page.install_submit_guard(
            &SubmitGuardConfig::new("#merge-tags-form", "/validate-merge-tags"),
            Box::new(transport),
            Box::new(reporter),
        )?);

        page.submit("#merge-tags-form")?;
        assert!(!page.disabled("[name=\"merge[0][value]\"]")?);
        assert_eq!(
            failures.borrow().as_slice(),
            &[SubmitOutcome::Rejected { status: 422 }]
        );

        page.submit("#merge-tags-form")?;
        assert_eq!(sent.borrow().len(), 2);
        assert_eq!(
            page.take_submit_outcomes(),
            vec![
                SubmitOutcome::Rejected { status: 422 },
                SubmitOutcome::Accepted { status: 200 },
            ]
        );
        Ok(())
    }

    #[test]
    fn unexpected_status_and_transport_failures_are_reported() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        let transport = RecordingTransport::respond_with(vec![
            Ok(TransportResponse::new(500, "Internal Server Error")),
            Err(TransportError::new("connection refused")),
        ]);
        let reporter = CollectingReporter::default();
        let failures = reporter.failures.clone();
        assert!(page.install_submit_guard(
            &SubmitGuardConfig::new("#merge-tags-form", "/validate-merge-tags"),
            Box::new(transport),
            Box::new(reporter),
        )?);

        page.submit("#merge-tags-form")?;
        page.submit("#merge-tags-form")?;

        assert_eq!(
            failures.borrow().as_slice(),
            &[
                SubmitOutcome::UnexpectedStatus {
                    status: 500,
                    status_text: "Internal Server Error".to_string(),
                },
                SubmitOutcome::TransportFailed {
                    message: "connection refused".to_string(),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn serialization_covers_named_controls_in_document_order() -> Result<()> {
        let html = r#"
        <form id="f">
          <input name="title" value="hello world">
          <input name="agree" type="checkbox" checked>
          <input name="skip-me" type="checkbox">
          <select name="tag">
            <option value="FNAME">First</option>
            <option value="LNAME" selected>Last</option>
          </select>
          <textarea name="notes">line one</textarea>
          <input type="text" value="anonymous">
          <button type="submit" name="ignored">Go</button>
        </form>
        "#;
        let mut page = FormPage::from_html(html)?;
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        assert!(page.install_submit_guard(
            &SubmitGuardConfig::new("#f", "/submit"),
            Box::new(transport),
            Box::new(TracingReporter),
        )?);

        page.submit("#f")?;

        let requests = sent.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].fields,
            vec![
                ("title".to_string(), "hello world".to_string()),
                ("agree".to_string(), "on".to_string()),
                ("tag".to_string(), "LNAME".to_string()),
                ("notes".to_string(), "line one".to_string()),
            ]
        );
        assert_eq!(
            requests[0].encoded_body(),
            "title=hello+world&agree=on&tag=LNAME&notes=line+one"
        );
        Ok(())
    }

    #[test]
    fn clicking_the_submit_button_submits_the_form() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        assert!(page.install_submit_guard(
            &SubmitGuardConfig::new("#merge-tags-form", "/validate-merge-tags"),
            Box::new(transport),
            Box::new(TracingReporter),
        )?);

        page.click("#merge-tags-form button")?;
        assert_eq!(sent.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn row_builder_and_guard_compose_on_one_form() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        assert!(page.install_row_builder(&merge_builder_config())?);
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        assert!(page.install_submit_guard(
            &SubmitGuardConfig::new("#merge-tags-form", "/validate-merge-tags"),
            Box::new(transport),
            Box::new(TracingReporter),
        )?);

        page.click("#add-merge-item")?;
        page.set_value("[name=\"merge[1][value]\"]", "Chris")?;
        page.submit("#merge-tags-form")?;

        let requests = sent.borrow();
        assert_eq!(requests.len(), 1);
        assert!(
            requests[0]
                .fields
                .contains(&("merge[1][value]".to_string(), "Chris".to_string()))
        );
        Ok(())
    }

    #[test]
    fn set_checked_rejects_non_checkbox_targets() -> Result<()> {
        let mut page = FormPage::from_html(MERGE_FORM_HTML)?;
        let error = page
            .set_checked("[name=\"merge[0][value]\"]", true)
            .expect_err("text input should not accept set_checked");
        match error {
            Error::TypeMismatch { expected, .. } => {
                assert_eq!(expected, "input[type=checkbox|radio]");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn radio_clicks_keep_one_choice_per_group() -> Result<()> {
        let html = r#"
        <form id="f">
          <input id="a" type="radio" name="pick" value="a" checked>
          <input id="b" type="radio" name="pick" value="b">
        </form>
        "#;
        let mut page = FormPage::from_html(html)?;
        page.click("#b")?;
        assert!(!page.checked("#a")?);
        assert!(page.checked("#b")?);
        Ok(())
    }

    #[test]
    fn selector_engine_supports_groups_attrs_and_descendants() -> Result<()> {
        let html = r#"
        <form id="f">
          <div class="row"><input name="x" type="text"></div>
          <select name="y"><option value="1">one</option></select>
        </form>
        "#;
        let page = FormPage::from_html(html)?;
        assert_eq!(page.count("select, input")?, 2);
        assert_eq!(page.count("#f .row input")?, 1);
        assert_eq!(page.count("[name=\"y\"]")?, 1);
        assert_eq!(page.count("input[type=text]")?, 1);
        assert!(page.exists("form#f"));
        Ok(())
    }

    #[test]
    fn unsupported_selectors_are_rejected() {
        let page = FormPage::from_html("<div id=\"x\"></div>").expect("parse");
        let error = page.count("div:first-child").expect_err("pseudo-class");
        match error {
            Error::UnsupportedSelector(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parser_handles_comments_void_tags_and_unquoted_attrs() -> Result<()> {
        let html = r#"
        <!-- header -->
        <form id=main>
          <input name=first value="a">
          <br>
          <input name="second" disabled>
        </form>
        "#;
        let page = FormPage::from_html(html)?;
        assert!(page.exists("#main"));
        assert_eq!(page.value("[name=\"first\"]")?, "a");
        assert!(page.disabled("[name=\"second\"]")?);
        Ok(())
    }

    #[test]
    fn parser_skips_script_and_style_content() -> Result<()> {
        let html = r#"
        <div id="wrap">
          <script>const x = "<div>not real</div>";</script>
          <style>.row { color: red; }</style>
          <p id="msg">visible</p>
        </div>
        "#;
        let page = FormPage::from_html(html)?;
        assert_eq!(page.count("#wrap p")?, 1);
        assert_eq!(page.text("#msg")?, "visible");
        assert!(!page.dump_document().contains("not real"));
        Ok(())
    }

    #[test]
    fn parser_reports_unclosed_comment() {
        let error = FormPage::from_html("<!-- never closed").expect_err("should fail");
        match error {
            Error::HtmlParse(msg) => assert!(msg.contains("comment")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn index_pattern_rewrites_only_delimited_indices() -> Result<()> {
        let pattern = IndexPattern::for_baseline(0)?;
        assert_eq!(pattern.rewrite("rows[0][qty]", 4)?, "rows[4][qty]");
        assert_eq!(pattern.rewrite("row-0", 4)?, "row-4");
        assert_eq!(pattern.rewrite("row_0_qty", 4)?, "row_4_qty");
        assert_eq!(pattern.rewrite("0", 4)?, "4");
        assert_eq!(pattern.rewrite("b20", 4)?, "b20");
        assert_eq!(pattern.rewrite("rows[10]", 4)?, "rows[10]");
        Ok(())
    }

    #[test]
    fn select_values_follow_selected_option() -> Result<()> {
        let html = r#"
        <form id="f">
          <select name="tag">
            <option value="FNAME">First</option>
            <option value="LNAME" selected>Last</option>
          </select>
        </form>
        "#;
        let mut page = FormPage::from_html(html)?;
        assert_eq!(page.value("[name=\"tag\"]")?, "LNAME");

        page.set_value("[name=\"tag\"]", "FNAME")?;
        assert_eq!(page.value("[name=\"tag\"]")?, "FNAME");

        page.set_value("[name=\"tag\"]", "MISSING")?;
        assert_eq!(page.value("[name=\"tag\"]")?, "");
        Ok(())
    }
}
