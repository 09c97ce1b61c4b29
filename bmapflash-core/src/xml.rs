//! A minimal element tree built from `xmlparser` tokens.
//!
//! bmap files are small, so the whole document is materialized. Only element
//! names, attributes and text content are kept; comments, processing
//! instructions and DTDs are skipped. Entity references in text are not
//! expanded since bmap fields are plain numbers and hex digests.
use crate::error::{Error, Result};
use xmlparser::{ElementEnd, Token, Tokenizer};

#[derive(Debug, Default)]
pub(crate) struct Element<'a> {
    pub name: &'a str,
    pub attributes: Vec<(&'a str, &'a str)>,
    pub text: String,
    pub children: Vec<Element<'a>>,
}

impl<'a> Element<'a> {
    pub fn attribute(&self, name: &str) -> Option<&'a str> {
        self.attributes
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }

    pub fn child(&self, name: &str) -> Option<&Element<'a>> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s Element<'a>> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Parses `text` and returns its root element.
pub(crate) fn parse(text: &str) -> Result<Element<'_>> {
    let mut stack: Vec<Element<'_>> = Vec::new();
    let mut root = None;

    for token in Tokenizer::from(text) {
        let token = token.map_err(|e| Error::format(format!("invalid XML: {e}")))?;
        match token {
            Token::ElementStart { local, .. } => {
                if root.is_some() {
                    return Err(Error::format("content after the root element"));
                }
                stack.push(Element {
                    name: local.as_str(),
                    ..Default::default()
                });
            }
            Token::Attribute { local, value, .. } => {
                if let Some(element) = stack.last_mut() {
                    element.attributes.push((local.as_str(), value.as_str()));
                }
            }
            Token::ElementEnd { end, .. } => {
                let element = match end {
                    ElementEnd::Open => continue,
                    ElementEnd::Empty => stack.pop(),
                    ElementEnd::Close(_, local) => {
                        let element = stack.pop();
                        if let Some(e) = &element {
                            if e.name != local.as_str() {
                                return Err(Error::format(format!(
                                    "mismatched closing tag: expected </{}>, found </{}>",
                                    e.name,
                                    local.as_str()
                                )));
                            }
                        }
                        element
                    }
                };
                let element =
                    element.ok_or_else(|| Error::format("closing tag without an opening tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Token::Text { text } | Token::Cdata { text, .. } => {
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(text.as_str());
                }
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::format("unexpected end of document"));
    }
    root.ok_or_else(|| Error::format("document has no root element"))
}
