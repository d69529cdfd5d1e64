use super::*;

use web_sys::{Document, Element, HtmlElement, Window};

use crate::panel::{FailurePanel, PANEL_STYLES};

pub(super) fn window() -> Result<Window, String> {
    web_sys::window().ok_or_else(|| "window is unavailable".to_string())
}

pub(super) fn document() -> Result<Document, String> {
    window()?
        .document()
        .ok_or_else(|| "document is unavailable".to_string())
}

pub(super) fn mount_element(container_id: &str) -> Result<Element, String> {
    document()?
        .get_element_by_id(container_id)
        .ok_or_else(|| format!("mount element #{container_id} was not found"))
}

pub(super) fn set_styles(element: &HtmlElement, styles: &[(&str, &str)]) -> Result<(), String> {
    let style = element.style();
    for (property, value) in styles {
        style
            .set_property(property, value)
            .map_err(|_| format!("failed to set style {property}"))?;
    }
    Ok(())
}

pub(super) fn create_html_element(document: &Document, tag: &str) -> Result<HtmlElement, String> {
    document
        .create_element(tag)
        .map_err(|_| format!("failed to create {tag} element"))?
        .dyn_into::<HtmlElement>()
        .map_err(|_| format!("{tag} element is not HtmlElement"))
}

/// Replaces the mount's children with a self-contained failure panel.
pub(super) fn render_failure_panel(container_id: &str, panel: &FailurePanel) -> Result<(), String> {
    let document = document()?;
    let mount = mount_element(container_id)?;
    mount.set_inner_html("");

    let container = create_html_element(&document, "div")?;
    container
        .set_attribute("role", "alert")
        .map_err(|_| "failed to mark failure panel as alert".to_string())?;
    container
        .set_attribute("data-chatwidget-error", panel.code)
        .map_err(|_| "failed to tag failure panel".to_string())?;
    set_styles(&container, PANEL_STYLES)?;

    for (index, line) in panel.lines().iter().enumerate() {
        let paragraph = create_html_element(&document, "p")?;
        paragraph.set_inner_text(line);
        let weight = if index == 0 { "600" } else { "400" };
        set_styles(&paragraph, &[("margin", "0"), ("font-weight", weight)])?;
        container
            .append_child(&paragraph)
            .map_err(|_| "failed to append failure panel line".to_string())?;
    }

    mount
        .append_child(&container)
        .map_err(|_| "failed to append failure panel".to_string())?;
    Ok(())
}
