use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Context, IdGenerator, RequestTemplate};

/// A request ready to be written into a pipeline slot.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub bytes: Arc<[u8]>,
    /// Index of the template that produced the request.
    pub template: usize,
    /// Index of the template's title in the run's title list.
    pub title: usize,
    pub head: bool,
}

/// Hands out wire requests for one connection, cycling through the
/// templates in order.
#[derive(Debug, Clone)]
pub struct RequestSequencer {
    templates: Vec<RequestTemplate>,
    titles: Vec<usize>,
    cursor: usize,
    host: String,
    ids: Option<IdGenerator>,
}

/// Distinct template titles in first-seen order.
pub fn titles_of(templates: &[RequestTemplate]) -> Vec<String> {
    let mut titles: Vec<String> = Vec::new();
    for template in templates {
        if !titles.iter().any(|title| title == template.title()) {
            titles.push(template.title().to_string());
        }
    }
    titles
}

impl RequestSequencer {
    /// `templates` must not be empty.
    pub fn new(templates: Vec<RequestTemplate>, host: impl Into<String>) -> Self {
        assert!(!templates.is_empty(), "a sequencer needs at least one template");

        let names = titles_of(&templates);
        let titles = templates
            .iter()
            .map(|template| {
                names
                    .iter()
                    .position(|name| name == template.title())
                    .unwrap_or(0)
            })
            .collect();

        Self {
            templates,
            titles,
            cursor: 0,
            host: host.into(),
            ids: None,
        }
    }

    pub fn with_id_replacement(mut self, ids: IdGenerator) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The template the next request will be built from.
    pub fn current(&self) -> &RequestTemplate {
        &self.templates[self.cursor]
    }

    pub fn needs_body(&self) -> bool {
        self.templates.iter().any(|t| t.on_response.is_some())
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn next_request(&mut self, context: &mut Context) -> Prepared {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.templates.len();

        let template = &mut self.templates[index];
        let ids = self.ids.as_ref();

        let (bytes, head): (Arc<[u8]>, bool) = match template.setup_request.clone() {
            Some(setup) => {
                let prepared = setup(template.clone(), context);
                let id = ids
                    .filter(|_| prepared.has_id_placeholder())
                    .map(IdGenerator::next_id);
                (
                    prepared.serialize(&self.host, id.as_deref()).into(),
                    prepared.is_head(),
                )
            }
            None => match ids.filter(|_| template.has_id_placeholder()) {
                Some(ids) => {
                    let id = ids.next_id();
                    (
                        template.serialize(&self.host, Some(&id)).into(),
                        template.is_head(),
                    )
                }
                None => (template.wire(&self.host), template.is_head()),
            },
        };

        Prepared {
            bytes,
            template: index,
            title: self.titles[index],
            head,
        }
    }

    pub fn on_response(&self, template: usize, status: u16, body: &str, context: &mut Context) {
        if let Some(hook) = &self.templates[template].on_response {
            hook(status, body, context);
        }
    }

    pub fn set_headers(&mut self, headers: BTreeMap<String, String>) {
        let template = &mut self.templates[self.cursor];
        template.set_headers(headers);
        template.rebuild(&self.host);
    }

    pub fn set_body(&mut self, body: Option<Vec<u8>>) {
        let template = &mut self.templates[self.cursor];
        template.set_body(body);
        template.rebuild(&self.host);
    }

    pub fn set_headers_and_body(&mut self, headers: BTreeMap<String, String>, body: Option<Vec<u8>>) {
        let template = &mut self.templates[self.cursor];
        template.set_headers(headers);
        template.set_body(body);
        template.rebuild(&self.host);
    }

    /// Replaces the current template. Its statistics stay under the title of
    /// the template it replaces.
    pub fn set_request(&mut self, mut request: RequestTemplate) {
        request.rebuild(&self.host);
        self.templates[self.cursor] = request;
    }
}
