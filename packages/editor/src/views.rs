//! Narrowed store views.
//!
//! Components rarely need the whole command vocabulary; a view projects
//! the dispatch seam down to one resource's `create / update / delete`
//! surface. Views are generic over [`Dispatch`], so the same projection
//! works against a bare [`crate::Store`] and against any wrapper that
//! routes changes onward.

use serde_json::Value;

use easel_model::{Bounds, Connector, EditMode, Element, Group, Selection, Step, Viewport};

use crate::command::Command;
use crate::store::{Change, Dispatch, DispatchOptions};

/// Element vocabulary.
pub struct ElementsView<'a, D: Dispatch> {
    inner: &'a mut D,
}

impl<D: Dispatch> ElementsView<'_, D> {
    pub fn create(&mut self, element: Element) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::CreateElement(element)], DispatchOptions::user())
    }

    pub fn update(&mut self, id: impl Into<String>, data: Value) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::MergeElement {
                id: id.into(),
                data,
            }],
            DispatchOptions::user(),
        )
    }

    pub fn set_bounds(
        &mut self,
        id: impl Into<String>,
        bounds: Bounds,
    ) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::SetElementBounds {
                id: id.into(),
                bounds,
            }],
            DispatchOptions::user(),
        )
    }

    pub fn delete(&mut self, ids: Vec<String>) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::DeleteElements(ids)], DispatchOptions::user())
    }
}

/// Connector vocabulary.
pub struct ConnectorsView<'a, D: Dispatch> {
    inner: &'a mut D,
}

impl<D: Dispatch> ConnectorsView<'_, D> {
    pub fn create(&mut self, connector: Connector) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::CreateConnector(connector)],
            DispatchOptions::user(),
        )
    }

    pub fn update(&mut self, id: impl Into<String>, data: Value) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::MergeConnector {
                id: id.into(),
                data,
            }],
            DispatchOptions::user(),
        )
    }

    pub fn delete(&mut self, ids: Vec<String>) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::DeleteConnectors(ids)], DispatchOptions::user())
    }
}

/// Group vocabulary.
pub struct GroupsView<'a, D: Dispatch> {
    inner: &'a mut D,
}

impl<D: Dispatch> GroupsView<'_, D> {
    pub fn create(&mut self, group: Group) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::CreateGroup(group)], DispatchOptions::user())
    }

    pub fn update(&mut self, id: impl Into<String>, data: Value) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::MergeGroup {
                id: id.into(),
                data,
            }],
            DispatchOptions::user(),
        )
    }

    pub fn dissolve(&mut self, id: impl Into<String>) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::DeleteGroup { id: id.into() }], DispatchOptions::user())
    }
}

/// Step vocabulary.
pub struct StepsView<'a, D: Dispatch> {
    inner: &'a mut D,
}

impl<D: Dispatch> StepsView<'_, D> {
    pub fn create(&mut self, step: Step) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::CreateStep(step)], DispatchOptions::user())
    }

    pub fn update(&mut self, id: impl Into<String>, data: Value) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::MergeStep {
                id: id.into(),
                data,
            }],
            DispatchOptions::user(),
        )
    }

    pub fn move_to(&mut self, id: impl Into<String>, order: u32) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::MoveStep {
                id: id.into(),
                order,
            }],
            DispatchOptions::user(),
        )
    }

    pub fn delete(&mut self, ids: Vec<String>) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::DeleteSteps(ids)], DispatchOptions::user())
    }
}

/// Document-level vocabulary.
pub struct DocumentView<'a, D: Dispatch> {
    inner: &'a mut D,
}

impl<D: Dispatch> DocumentView<'_, D> {
    pub fn set_title(&mut self, title: impl Into<String>) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::SetTitle(title.into())], DispatchOptions::user())
    }

    pub fn set_theme(&mut self, theme: impl Into<String>) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::SetTheme(theme.into())], DispatchOptions::user())
    }

    pub fn set_background(
        &mut self,
        background: impl Into<String>,
    ) -> Result<Option<Change>, D::Error> {
        self.inner.dispatch(
            vec![Command::SetBackground(background.into())],
            DispatchOptions::user(),
        )
    }

    pub fn select(&mut self, selection: Selection) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::SetSelection(selection)], DispatchOptions::user())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::SetViewport(viewport)], DispatchOptions::user())
    }

    pub fn set_mode(&mut self, mode: EditMode) -> Result<Option<Change>, D::Error> {
        self.inner
            .dispatch(vec![Command::SetMode(mode)], DispatchOptions::user())
    }
}

/// Narrowing entry points, available on anything that dispatches.
pub trait Views: Dispatch + Sized {
    fn elements(&mut self) -> ElementsView<'_, Self> {
        ElementsView { inner: self }
    }

    fn connectors(&mut self) -> ConnectorsView<'_, Self> {
        ConnectorsView { inner: self }
    }

    fn groups(&mut self) -> GroupsView<'_, Self> {
        GroupsView { inner: self }
    }

    fn steps(&mut self) -> StepsView<'_, Self> {
        StepsView { inner: self }
    }

    fn document(&mut self) -> DocumentView<'_, Self> {
        DocumentView { inner: self }
    }
}

impl<D: Dispatch + Sized> Views for D {}
